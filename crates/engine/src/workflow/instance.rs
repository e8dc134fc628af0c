use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{new_id, WorkflowStatus};
use crate::{Error, Result};

/// One run of a workflow definition.
///
/// Every lifecycle method checks the current status first and returns
/// `Error::StateConflict` without touching any field when the move is not allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_definition_id: String,
    pub name: String,
    pub user_id: String,
    pub status: WorkflowStatus,
    pub current_step_id: Option<String>,
    pub error_message: Option<String>,
    pub priority: i32,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        workflow_definition_id: impl Into<String>,
        name: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            workflow_definition_id: workflow_definition_id.into(),
            name: name.into(),
            user_id: user_id.into(),
            status: WorkflowStatus::Pending,
            current_step_id: None,
            error_message: None,
            priority: 0,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn guard(&self, allowed: &[WorkflowStatus], action: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(Error::StateConflict(format!(
                "Cannot {} workflow instance {} in status {}",
                action, self.id, self.status
            )))
        }
    }

    pub fn start(&mut self, first_step_id: impl Into<String>) -> Result<()> {
        self.guard(&[WorkflowStatus::Pending], "start")?;
        let now = Utc::now();
        self.status = WorkflowStatus::Running;
        self.current_step_id = Some(first_step_id.into());
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Moves the step pointer. Status is left alone.
    pub fn transition_to(&mut self, step_id: impl Into<String>) -> Result<()> {
        self.guard(&[WorkflowStatus::Running], "transition")?;
        self.current_step_id = Some(step_id.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.guard(&[WorkflowStatus::Running], "pause")?;
        self.status = WorkflowStatus::Paused;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.guard(&[WorkflowStatus::Paused], "resume")?;
        self.status = WorkflowStatus::Running;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.guard(&[WorkflowStatus::Running], "complete")?;
        let now = Utc::now();
        self.status = WorkflowStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.guard(&[WorkflowStatus::Running], "fail")?;
        let now = Utc::now();
        self.status = WorkflowStatus::Failed;
        self.error_message = Some(reason.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.guard(&[WorkflowStatus::Pending, WorkflowStatus::Running], "cancel")?;
        let now = Utc::now();
        self.status = WorkflowStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }

    /// Wall-clock run time in minutes, once the instance has both timestamps.
    pub fn duration_minutes(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 60_000.0)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> WorkflowInstance {
        let mut instance = WorkflowInstance::new("def-1", "Test Workflow", "user-1");
        instance.start("start").unwrap();
        instance
    }

    #[test]
    fn test_start_sets_pointer_and_timestamp() {
        let instance = running();
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert_eq!(instance.current_step_id.as_deref(), Some("start"));
        assert!(instance.started_at.is_some());
    }

    #[test]
    fn test_start_twice_is_conflict() {
        let mut instance = running();
        let err = instance.start("other").unwrap_err();
        assert!(err.is_state_conflict());
        assert_eq!(instance.current_step_id.as_deref(), Some("start"));
    }

    #[test]
    fn test_pause_resume_round_trip() {
        let mut instance = running();
        instance.pause().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Paused);
        assert!(instance.transition_to("a").is_err());
        assert!(instance.pause().is_err());
        instance.resume().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert!(instance.resume().is_err());
    }

    #[test]
    fn test_transition_keeps_status() {
        let mut instance = running();
        instance.transition_to("a").unwrap();
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert_eq!(instance.current_step_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut completed = running();
        completed.complete().unwrap();
        assert!(completed.completed_at.is_some());

        let mut failed = running();
        failed.fail("boom").unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        let mut cancelled = running();
        cancelled.cancel().unwrap();

        for mut instance in [completed, failed, cancelled] {
            let before = instance.status;
            assert!(instance.cancel().unwrap_err().is_state_conflict());
            assert!(instance.pause().is_err());
            assert!(instance.complete().is_err());
            assert!(instance.fail("again").is_err());
            assert!(instance.transition_to("x").is_err());
            assert_eq!(instance.status, before);
        }
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut instance = WorkflowInstance::new("def-1", "Test", "user-1");
        instance.cancel().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Cancelled);
    }

    #[test]
    fn test_cancel_from_paused_is_conflict() {
        let mut instance = running();
        instance.pause().unwrap();
        assert!(instance.cancel().is_err());
        assert_eq!(instance.status, WorkflowStatus::Paused);
    }
}
