use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::workflow::{StepStatus, WorkflowStatus};

lazy_static! {
    pub static ref WORKFLOW_INSTANCES_STARTED: IntCounter = IntCounter::new(
        "workflow_instances_started_total",
        "Total number of workflow instances started."
    )
    .expect("valid metric definition");
    pub static ref WORKFLOW_INSTANCES_FINISHED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "workflow_instances_finished_total",
            "Total number of workflow instances that reached a terminal status."
        ),
        &["status"]
    )
    .expect("valid metric definition");
    pub static ref WORKFLOW_STEP_EXECUTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "workflow_step_executions_total",
            "Total number of step executions that completed or failed."
        ),
        &["status"]
    )
    .expect("valid metric definition");
    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        for result in [
            registry.register(Box::new(WORKFLOW_INSTANCES_STARTED.clone())),
            registry.register(Box::new(WORKFLOW_INSTANCES_FINISHED.clone())),
            registry.register(Box::new(WORKFLOW_STEP_EXECUTIONS.clone())),
        ] {
            if let Err(e) = result {
                tracing::warn!("Failed to register metric: {}", e);
            }
        }
        registry
    };
}

pub fn record_instance_started() {
    WORKFLOW_INSTANCES_STARTED.inc();
}

pub fn record_instance_finished(status: WorkflowStatus) {
    let label = status.to_string();
    WORKFLOW_INSTANCES_FINISHED
        .with_label_values(&[label.as_str()])
        .inc();
}

pub fn record_step_execution(status: StepStatus) {
    let label = status.to_string();
    WORKFLOW_STEP_EXECUTIONS
        .with_label_values(&[label.as_str()])
        .inc();
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> crate::Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::Error::Internal(format!("Metrics are not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_recorded_counters() {
        record_instance_started();
        record_instance_finished(WorkflowStatus::Completed);
        record_step_execution(StepStatus::Failed);

        let text = gather_metrics().unwrap();
        assert!(text.contains("workflow_instances_started_total"));
        assert!(text.contains("workflow_instances_finished_total{status=\"COMPLETED\"}"));
        assert!(text.contains("workflow_step_executions_total{status=\"FAILED\"}"));
    }
}
