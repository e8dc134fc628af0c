use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle of a workflow instance.
///
/// `Paused` is a sub-state of `Running`; the three terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 6] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        WorkflowStatus::Paused,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "PENDING"),
            WorkflowStatus::Running => write!(f, "RUNNING"),
            WorkflowStatus::Paused => write!(f, "PAUSED"),
            WorkflowStatus::Completed => write!(f, "COMPLETED"),
            WorkflowStatus::Failed => write!(f, "FAILED"),
            WorkflowStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WorkflowStatus::Pending),
            "RUNNING" => Ok(WorkflowStatus::Running),
            "PAUSED" => Ok(WorkflowStatus::Paused),
            "COMPLETED" => Ok(WorkflowStatus::Completed),
            "FAILED" => Ok(WorkflowStatus::Failed),
            "CANCELLED" => Ok(WorkflowStatus::Cancelled),
            _ => Err(Error::Internal(format!("Invalid workflow status: {}", s))),
        }
    }
}

/// Lifecycle of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Assigned,
    Running,
    /// Parked until an external actor reports an outcome.
    Waiting,
    Completed,
    Failed,
    Skipped,
    /// Outlived its timeout while running or waiting.
    #[serde(rename = "TIMEOUT")]
    TimedOut,
}

impl StepStatus {
    pub const ALL: [StepStatus; 8] = [
        StepStatus::Pending,
        StepStatus::Assigned,
        StepStatus::Running,
        StepStatus::Waiting,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Skipped,
        StepStatus::TimedOut,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::TimedOut
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "PENDING"),
            StepStatus::Assigned => write!(f, "ASSIGNED"),
            StepStatus::Running => write!(f, "RUNNING"),
            StepStatus::Waiting => write!(f, "WAITING"),
            StepStatus::Completed => write!(f, "COMPLETED"),
            StepStatus::Failed => write!(f, "FAILED"),
            StepStatus::Skipped => write!(f, "SKIPPED"),
            StepStatus::TimedOut => write!(f, "TIMEOUT"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "ASSIGNED" => Ok(StepStatus::Assigned),
            "RUNNING" => Ok(StepStatus::Running),
            "WAITING" => Ok(StepStatus::Waiting),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            "SKIPPED" => Ok(StepStatus::Skipped),
            "TIMEOUT" => Ok(StepStatus::TimedOut),
            _ => Err(Error::Internal(format!("Invalid step status: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_matches_serde_names() {
        for status in WorkflowStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            assert_eq!(status.to_string().parse::<WorkflowStatus>().unwrap(), status);
        }
        for status in StepStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            assert_eq!(status.to_string().parse::<StepStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Waiting.is_terminal());
        assert!(StepStatus::TimedOut.is_terminal());
        assert_eq!(StepStatus::TimedOut.to_string(), "TIMEOUT");
        assert!("sleeping".parse::<WorkflowStatus>().is_err());
    }
}
