//! Read-only reporting over the store: status counts, completion times and
//! instances or steps that have stopped making progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
    store::Store,
    workflow::{StepExecution, StepStatus, WorkflowInstance, WorkflowStatus},
    Result,
};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatistics {
    pub instances_by_status: BTreeMap<String, usize>,
    pub total_instances: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_completion_minutes: Option<f64>,
    /// Left empty for per-definition statistics
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub step_executions_by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatistics {
    pub by_status: BTreeMap<String, usize>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_execution_seconds: Option<f64>,
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn instance_counts(instances: &[WorkflowInstance]) -> BTreeMap<String, usize> {
    WorkflowStatus::ALL
        .iter()
        .map(|status| {
            let count = instances.iter().filter(|i| i.status == *status).count();
            (status.to_string(), count)
        })
        .collect()
}

fn average_completion_minutes(instances: &[WorkflowInstance]) -> Option<f64> {
    average(
        instances
            .iter()
            .filter(|i| i.status == WorkflowStatus::Completed)
            .filter_map(WorkflowInstance::duration_minutes),
    )
}

pub struct WorkflowMonitor {
    store: Arc<dyn Store>,
}

impl WorkflowMonitor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn all_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let mut instances = Vec::new();
        for status in WorkflowStatus::ALL {
            instances.extend(self.store.list_instances_by_status(status).await?);
        }
        Ok(instances)
    }

    pub async fn statistics(&self) -> Result<WorkflowStatistics> {
        let instances = self.all_instances().await?;

        let mut step_executions_by_status = BTreeMap::new();
        for status in StepStatus::ALL {
            let count = self.store.list_step_executions_by_status(status).await?.len();
            step_executions_by_status.insert(status.to_string(), count);
        }

        Ok(WorkflowStatistics {
            instances_by_status: instance_counts(&instances),
            total_instances: instances.len(),
            average_completion_minutes: average_completion_minutes(&instances),
            step_executions_by_status,
        })
    }

    pub async fn statistics_for_definition(&self, definition_id: &str) -> Result<WorkflowStatistics> {
        let instances = self.store.list_instances_by_definition(definition_id).await?;

        Ok(WorkflowStatistics {
            instances_by_status: instance_counts(&instances),
            total_instances: instances.len(),
            average_completion_minutes: average_completion_minutes(&instances),
            step_executions_by_status: BTreeMap::new(),
        })
    }

    pub async fn step_statistics(&self, instance_id: &str) -> Result<StepStatistics> {
        let executions = self.store.list_step_executions(instance_id).await?;

        let by_status = StepStatus::ALL
            .iter()
            .map(|status| {
                let count = executions.iter().filter(|e| e.status == *status).count();
                (status.to_string(), count)
            })
            .collect();

        let average_execution_seconds = average(
            executions
                .iter()
                .filter(|e| e.status == StepStatus::Completed)
                .filter_map(|e| match (e.started_at, e.completed_at) {
                    (Some(started), Some(completed)) => {
                        Some((completed - started).num_milliseconds() as f64 / 1000.0)
                    }
                    _ => None,
                }),
        );

        Ok(StepStatistics {
            by_status,
            total: executions.len(),
            average_execution_seconds,
        })
    }

    pub async fn failed_instances(&self) -> Result<Vec<WorkflowInstance>> {
        self.store.list_instances_by_status(WorkflowStatus::Failed).await
    }

    pub async fn failed_step_executions(&self) -> Result<Vec<StepExecution>> {
        self.store.list_step_executions_by_status(StepStatus::Failed).await
    }

    /// Step executions the timeout sweep closed as TIMEOUT.
    pub async fn timed_out_step_executions(&self) -> Result<Vec<StepExecution>> {
        self.store.list_step_executions_by_status(StepStatus::TimedOut).await
    }

    /// COMPLETED instances that finished within `[start, end]`.
    pub async fn completed_instances_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>> {
        self.store.list_instances_completed_between(start, end).await
    }

    /// Every instance started by `user_id`, newest first.
    pub async fn instances_by_user(&self, user_id: &str) -> Result<Vec<WorkflowInstance>> {
        self.store.list_instances_by_user(user_id).await
    }

    /// RUNNING instances started before `now - older_than`.
    pub async fn long_running_instances(&self, older_than: Duration) -> Result<Vec<WorkflowInstance>> {
        let threshold = Utc::now() - older_than;
        Ok(self
            .store
            .list_instances_by_status(WorkflowStatus::Running)
            .await?
            .into_iter()
            .filter(|i| i.started_at.map_or(false, |started| started < threshold))
            .collect())
    }

    /// RUNNING instances that have not been touched since `now - older_than`.
    pub async fn detect_stalled_instances(&self, older_than: Duration) -> Result<Vec<WorkflowInstance>> {
        let threshold = Utc::now() - older_than;
        let stalled: Vec<_> = self
            .store
            .list_instances_by_status(WorkflowStatus::Running)
            .await?
            .into_iter()
            .filter(|i| i.updated_at < threshold)
            .collect();
        debug!("Found {} stalled workflow instance(s)", stalled.len());
        Ok(stalled)
    }

    /// Running or waiting step executions not updated since `now - older_than`.
    pub async fn detect_stalled_step_executions(&self, older_than: Duration) -> Result<Vec<StepExecution>> {
        let threshold = Utc::now() - older_than;
        let mut stalled = Vec::new();
        for status in [StepStatus::Running, StepStatus::Waiting] {
            stalled.extend(
                self.store
                    .list_step_executions_by_status(status)
                    .await?
                    .into_iter()
                    .filter(|e| e.updated_at < threshold),
            );
        }
        debug!("Found {} stalled step execution(s)", stalled.len());
        Ok(stalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn finished(minutes: i64) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new("def-1", "run", "user");
        instance.start("start").unwrap();
        instance.complete().unwrap();
        let completed = Utc::now();
        instance.started_at = Some(completed - Duration::minutes(minutes));
        instance.completed_at = Some(completed);
        instance
    }

    #[tokio::test]
    async fn test_statistics_counts_and_average() {
        let store = Arc::new(MemoryStore::new());
        store.save_instance(finished(30)).await.unwrap();
        store.save_instance(finished(60)).await.unwrap();
        store
            .save_instance(WorkflowInstance::new("def-2", "waiting", "user"))
            .await
            .unwrap();

        let mut failed_step = StepExecution::new("i-1", "a", "A");
        failed_step.start().unwrap();
        failed_step.fail("boom").unwrap();
        store.save_step_execution(failed_step).await.unwrap();

        let monitor = WorkflowMonitor::new(store);
        let stats = monitor.statistics().await.unwrap();
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.instances_by_status["COMPLETED"], 2);
        assert_eq!(stats.instances_by_status["PENDING"], 1);
        assert_eq!(stats.instances_by_status["CANCELLED"], 0);
        let avg = stats.average_completion_minutes.unwrap();
        assert!((avg - 45.0).abs() < 0.01);
        assert_eq!(stats.step_executions_by_status["FAILED"], 1);

        let per_definition = monitor.statistics_for_definition("def-2").await.unwrap();
        assert_eq!(per_definition.total_instances, 1);
        assert!(per_definition.average_completion_minutes.is_none());
        assert_eq!(monitor.failed_step_executions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_detection_uses_updated_at() {
        let store = Arc::new(MemoryStore::new());

        let mut stale = WorkflowInstance::new("def", "stale", "user");
        stale.start("start").unwrap();
        stale.updated_at = Utc::now() - Duration::minutes(30);
        stale.started_at = Some(Utc::now() - Duration::hours(1));
        let stale_id = stale.id.clone();

        let mut fresh = WorkflowInstance::new("def", "fresh", "user");
        fresh.start("start").unwrap();

        store.save_instance(stale).await.unwrap();
        store.save_instance(fresh).await.unwrap();

        let mut waiting = StepExecution::new(&stale_id, "task", "Task");
        waiting.start().unwrap();
        waiting.wait().unwrap();
        waiting.updated_at = Utc::now() - Duration::minutes(30);
        store.save_step_execution(waiting).await.unwrap();

        let monitor = WorkflowMonitor::new(store);
        let stalled = monitor
            .detect_stalled_instances(Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, stale_id);

        let long_running = monitor
            .long_running_instances(Duration::minutes(45))
            .await
            .unwrap();
        assert_eq!(long_running.len(), 1);

        let stalled_steps = monitor
            .detect_stalled_step_executions(Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(stalled_steps.len(), 1);
        assert_eq!(stalled_steps[0].status, StepStatus::Waiting);
    }

    #[tokio::test]
    async fn test_timed_out_and_per_user_queries() {
        let store = Arc::new(MemoryStore::new());

        let mut old = finished(10);
        let mut recent = finished(5);
        recent.user_id = "user-2".to_string();
        let old_completed = Utc::now() - Duration::days(2);
        old.completed_at = Some(old_completed);
        old.started_at = Some(old_completed - Duration::minutes(10));
        let recent_id = recent.id.clone();
        store.save_instance(old).await.unwrap();
        store.save_instance(recent).await.unwrap();
        store
            .save_instance(WorkflowInstance::new("def-1", "pending", "user-2"))
            .await
            .unwrap();

        let mut overdue = StepExecution::new("i-1", "task", "Task");
        overdue.start().unwrap();
        overdue.time_out("Step task timed out after 300 seconds").unwrap();
        store.save_step_execution(overdue).await.unwrap();
        let mut failed = StepExecution::new("i-1", "other", "Other");
        failed.start().unwrap();
        failed.fail("boom").unwrap();
        store.save_step_execution(failed).await.unwrap();

        let monitor = WorkflowMonitor::new(store);

        let timed_out = monitor.timed_out_step_executions().await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].step_id, "task");
        assert_eq!(monitor.failed_step_executions().await.unwrap().len(), 1);

        let last_day = monitor
            .completed_instances_between(Utc::now() - Duration::days(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(last_day.len(), 1);
        assert_eq!(last_day[0].id, recent_id);
        let last_week = monitor
            .completed_instances_between(Utc::now() - Duration::days(7), Utc::now())
            .await
            .unwrap();
        assert_eq!(last_week.len(), 2);

        assert_eq!(monitor.instances_by_user("user-2").await.unwrap().len(), 2);
        assert_eq!(monitor.instances_by_user("user").await.unwrap().len(), 1);
        assert!(monitor.instances_by_user("nobody").await.unwrap().is_empty());
    }
}
