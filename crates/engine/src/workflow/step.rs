use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{new_id, StepStatus, WorkflowStep};
use crate::{Error, Result};

/// Record of one attempt to run one step of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub id: String,
    pub workflow_instance_id: String,
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub assigned_agent_id: Option<String>,
    pub assigned_agent_role: Option<String>,
    pub timeout_seconds: u64,
    /// 1-based attempt number for this step within the instance
    pub attempt: u32,
    pub input: HashMap<String, Value>,
    pub output: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub logs: Vec<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(
        workflow_instance_id: impl Into<String>,
        step_id: impl Into<String>,
        step_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            workflow_instance_id: workflow_instance_id.into(),
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Pending,
            assigned_agent_id: None,
            assigned_agent_role: None,
            timeout_seconds: super::definition::DEFAULT_TIMEOUT_SECONDS,
            attempt: 1,
            input: HashMap::new(),
            output: HashMap::new(),
            metadata: HashMap::new(),
            logs: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Fresh PENDING record for `step`, carrying its timeout.
    pub fn for_step(workflow_instance_id: impl Into<String>, step: &WorkflowStep) -> Self {
        let mut execution = Self::new(workflow_instance_id, step.id.clone(), step.name.clone());
        execution.timeout_seconds = step.timeout_seconds;
        execution
    }

    /// Next attempt of the same step after this one failed.
    pub fn retry(&self) -> Self {
        let mut execution = Self::new(
            self.workflow_instance_id.clone(),
            self.step_id.clone(),
            self.step_name.clone(),
        );
        execution.timeout_seconds = self.timeout_seconds;
        execution.attempt = self.attempt + 1;
        execution.input = self.input.clone();
        execution.log(format!("Retry of step execution {}", self.id));
        execution
    }

    fn guard(&self, allowed: &[StepStatus], action: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(Error::StateConflict(format!(
                "Cannot {} step execution {} ({}) in status {}",
                action, self.id, self.step_id, self.status
            )))
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let now = Utc::now();
        self.logs.push(format!("{} {}", now.to_rfc3339(), line.into()));
        self.updated_at = now;
    }

    pub fn assign(&mut self, agent_id: impl Into<String>, agent_role: Option<String>) -> Result<()> {
        self.guard(&[StepStatus::Pending], "assign")?;
        let agent_id = agent_id.into();
        self.log(format!("Assigned to agent {}", agent_id));
        self.assigned_agent_id = Some(agent_id);
        self.assigned_agent_role = agent_role;
        self.status = StepStatus::Assigned;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.guard(&[StepStatus::Pending, StepStatus::Assigned], "start")?;
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        self.log("Started");
        Ok(())
    }

    /// Park a running step until an outcome is reported from outside.
    pub fn wait(&mut self) -> Result<()> {
        self.guard(&[StepStatus::Running], "suspend")?;
        self.status = StepStatus::Waiting;
        self.log("Waiting for external completion");
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.guard(
            &[StepStatus::Running, StepStatus::Assigned, StepStatus::Waiting],
            "complete",
        )?;
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.log("Completed");
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.guard(
            &[StepStatus::Running, StepStatus::Assigned, StepStatus::Waiting],
            "fail",
        )?;
        let reason = reason.into();
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.log(format!("Failed: {}", reason));
        self.error_message = Some(reason);
        Ok(())
    }

    /// Close an in-flight step that outlived `timeout_seconds`.
    pub fn time_out(&mut self, reason: impl Into<String>) -> Result<()> {
        self.guard(
            &[StepStatus::Running, StepStatus::Assigned, StepStatus::Waiting],
            "time out",
        )?;
        let reason = reason.into();
        self.status = StepStatus::TimedOut;
        self.completed_at = Some(Utc::now());
        self.log(format!("Timed out: {}", reason));
        self.error_message = Some(reason);
        Ok(())
    }

    /// Close a step that never started without running it.
    pub fn skip(&mut self) -> Result<()> {
        self.guard(&[StepStatus::Pending, StepStatus::Assigned], "skip")?;
        self.status = StepStatus::Skipped;
        self.completed_at = Some(Utc::now());
        self.log("Skipped");
        Ok(())
    }

    /// Seconds since the step started, or zero if it never did.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// True when an in-flight step has outlived its `timeout_seconds`.
    /// A zero timeout never expires.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.timeout_seconds == 0 {
            return false;
        }
        let in_flight = matches!(self.status, StepStatus::Running | StepStatus::Waiting);
        match self.started_at {
            Some(started) if in_flight => {
                now - started > Duration::seconds(self.timeout_seconds as i64)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> StepExecution {
        StepExecution::new("instance-1", "a", "Review")
    }

    #[test]
    fn test_happy_path_stamps_timestamps() {
        let mut execution = pending();
        execution.assign("agent-7", Some("reviewer".to_string())).unwrap();
        assert_eq!(execution.status, StepStatus::Assigned);
        execution.start().unwrap();
        assert!(execution.started_at.is_some());
        execution.complete().unwrap();
        assert_eq!(execution.status, StepStatus::Completed);
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.logs.len(), 3);
    }

    #[test]
    fn test_assign_only_from_pending() {
        let mut execution = pending();
        execution.start().unwrap();
        let err = execution.assign("agent-7", None).unwrap_err();
        assert!(err.is_state_conflict());
        assert!(execution.assigned_agent_id.is_none());
    }

    #[test]
    fn test_complete_requires_started_or_assigned() {
        let mut execution = pending();
        assert!(execution.complete().is_err());
        assert!(execution.fail("nope").is_err());
        assert_eq!(execution.status, StepStatus::Pending);

        execution.assign("agent-7", None).unwrap();
        execution.complete().unwrap();
        assert!(execution.start().is_err());
    }

    #[test]
    fn test_waiting_step_can_complete_or_fail() {
        let mut execution = pending();
        execution.start().unwrap();
        execution.wait().unwrap();
        assert_eq!(execution.status, StepStatus::Waiting);
        execution.fail("agent gave up").unwrap();
        assert_eq!(execution.error_message.as_deref(), Some("agent gave up"));
        assert!(execution.complete().is_err());
    }

    #[test]
    fn test_timeout_detection() {
        let mut execution = pending();
        execution.timeout_seconds = 10;
        let now = Utc::now();
        assert!(!execution.is_timed_out(now));

        execution.start().unwrap();
        execution.started_at = Some(now - Duration::seconds(11));
        assert!(execution.is_timed_out(now));
        assert_eq!(execution.elapsed_seconds(now), 11);

        execution.timeout_seconds = 0;
        assert!(!execution.is_timed_out(now));
    }

    #[test]
    fn test_time_out_only_while_in_flight() {
        let mut execution = pending();
        assert!(execution.time_out("too slow").is_err());

        execution.start().unwrap();
        execution.wait().unwrap();
        execution.time_out("too slow").unwrap();
        assert_eq!(execution.status, StepStatus::TimedOut);
        assert_eq!(execution.error_message.as_deref(), Some("too slow"));
        assert!(execution.completed_at.is_some());
        assert!(execution.complete().is_err());
    }

    #[test]
    fn test_skip_only_before_start() {
        let mut execution = pending();
        execution.skip().unwrap();
        assert_eq!(execution.status, StepStatus::Skipped);
        assert!(execution.start().is_err());

        let mut running = pending();
        running.start().unwrap();
        assert!(running.skip().unwrap_err().is_state_conflict());
        assert_eq!(running.status, StepStatus::Running);
    }

    #[test]
    fn test_retry_increments_attempt() {
        let mut execution = pending();
        execution.timeout_seconds = 42;
        let retry = execution.retry();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.status, StepStatus::Pending);
        assert_eq!(retry.timeout_seconds, 42);
        assert_ne!(retry.id, execution.id);
        execution.start().unwrap();
    }
}
