use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use workflow_engine::{
    agent::StaticAgentAssigner,
    config::{EngineConfig, TaskCompletionMode},
    monitor::WorkflowMonitor,
    store::{create_store, DatabaseConfig, Store},
    workflow::{
        ExecutionContext, StepExecutor, StepOutcome, StepStatus, WorkflowDefinition,
        WorkflowEngine, WorkflowInstance, WorkflowStatus,
    },
    Error,
};

async fn sqlite_store() -> Arc<dyn Store> {
    let store = create_store(&DatabaseConfig::sqlite_in_memory())
        .await
        .expect("Failed to create store");
    store.init().await.expect("Failed to initialize store");
    store
}

fn document_review() -> WorkflowDefinition {
    WorkflowDefinition::from_yaml(include_str!("../definitions/document-review.yaml")).unwrap()
}

#[tokio::test]
async fn test_definition_round_trip() {
    let store = sqlite_store().await;
    let definition = document_review();
    store.save_definition(definition.clone()).await.unwrap();

    let loaded = store.get_definition("document-review").await.unwrap().unwrap();
    assert_eq!(loaded.name, definition.name);
    assert_eq!(loaded.steps.len(), definition.steps.len());
    assert_eq!(loaded.transitions.len(), definition.transitions.len());
    assert_eq!(
        loaded.step("review").unwrap().agent_role_required.as_deref(),
        Some("legal-reviewer")
    );

    let mut inactive = definition.clone();
    inactive.is_active = false;
    store.save_definition(inactive).await.unwrap();
    assert!(store.list_definitions(true).await.unwrap().is_empty());
    assert_eq!(store.list_definitions(false).await.unwrap().len(), 1);

    store.delete_definition("document-review").await.unwrap();
    assert!(store.get_definition("document-review").await.unwrap().is_none());
}

#[tokio::test]
async fn test_context_version_check() {
    let store = sqlite_store().await;
    let mut context = ExecutionContext::new("instance-1");
    store.save_execution_context(context.clone(), None).await.unwrap();

    context.put("a", json!(1));
    store
        .save_execution_context(context.clone(), Some(1))
        .await
        .unwrap();

    let err = store
        .save_execution_context(context.clone(), Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VersionConflict(_)));

    let stored = store.get_execution_context("instance-1").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.get("a"), Some(&json!(1)));
}

#[tokio::test]
async fn test_instance_listing_and_delete() {
    let store = sqlite_store().await;

    let mut running = WorkflowInstance::new("def-1", "first", "user");
    running.start("start").unwrap();
    let pending = WorkflowInstance::new("def-2", "second", "user");
    store.save_instance(running.clone()).await.unwrap();
    store.save_instance(pending.clone()).await.unwrap();

    let by_status = store
        .list_instances_by_status(WorkflowStatus::Running)
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].current_step_id.as_deref(), Some("start"));
    assert_eq!(store.list_instances_by_definition("def-2").await.unwrap().len(), 1);
    assert_eq!(store.list_instances(10, 0).await.unwrap().len(), 2);
    assert_eq!(store.list_instances(10, 1).await.unwrap().len(), 1);

    store
        .save_step_execution(workflow_engine::workflow::StepExecution::new(&running.id, "start", "Start"))
        .await
        .unwrap();
    store.delete_instance(&running.id).await.unwrap();
    assert!(store.get_instance(&running.id).await.unwrap().is_none());
    assert!(store.list_step_executions(&running.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_engine_runs_on_sqlite() {
    let store = sqlite_store().await;
    store.save_definition(document_review()).await.unwrap();

    let config = EngineConfig {
        task_completion: TaskCompletionMode::External,
        evaluate_conditions: true,
        timeout_sweep_interval_secs: 0,
        ..EngineConfig::default()
    };
    let engine = Arc::new(WorkflowEngine::new(
        store.clone(),
        Arc::new(StaticAgentAssigner::new("reviewer-1")),
        Arc::new(StepExecutor::new()),
        config,
    ));
    engine.clone().start().await;

    let initial: HashMap<_, _> = [
        ("amount".to_string(), json!(25000)),
        ("documentId".to_string(), json!("contract-9")),
    ]
    .into_iter()
    .collect();
    let instance = engine
        .start_workflow("document-review", "contract", "user-1", initial)
        .await
        .unwrap();
    engine.wait_for_idle(&instance.id).await.unwrap();

    let waiting = store
        .find_step_executions_by_status(&instance.id, StepStatus::Waiting)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].step_id, "review");
    assert_eq!(waiting[0].assigned_agent_id.as_deref(), Some("reviewer-1"));
    assert_eq!(waiting[0].timeout_seconds, 86400);
    assert!(!waiting[0].logs.is_empty());

    let output: HashMap<_, _> = [("approved".to_string(), json!(true))].into_iter().collect();
    engine
        .report_step_completion(&waiting[0].id, StepOutcome::Completed { output })
        .await
        .unwrap();
    engine.wait_for_idle(&instance.id).await.unwrap();

    let finished = store.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.current_step_id.as_deref(), Some("end"));

    let steps: Vec<_> = store
        .list_step_executions(&instance.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.step_id)
        .collect();
    assert_eq!(steps, vec!["start", "extract", "route", "review", "notify", "end"]);

    let context = store.get_execution_context(&instance.id).await.unwrap().unwrap();
    assert_eq!(context.get("approved"), Some(&json!(true)));
    assert_eq!(context.get("documentId"), Some(&json!("contract-9")));

    let monitor = WorkflowMonitor::new(store.clone());
    let stats = monitor.statistics().await.unwrap();
    assert_eq!(stats.total_instances, 1);
    assert_eq!(stats.instances_by_status["COMPLETED"], 1);
    assert_eq!(stats.step_executions_by_status["COMPLETED"], 6);
    let step_stats = monitor.step_statistics(&instance.id).await.unwrap();
    assert_eq!(step_stats.total, 6);
}

#[tokio::test]
async fn test_user_and_completion_window_queries() {
    let store = sqlite_store().await;

    let mut done = WorkflowInstance::new("def-1", "done", "user-1");
    done.start("start").unwrap();
    done.complete().unwrap();
    let running = {
        let mut instance = WorkflowInstance::new("def-1", "running", "user-1");
        instance.start("start").unwrap();
        instance
    };
    let other = WorkflowInstance::new("def-1", "other", "user-2");
    store.save_instance(done.clone()).await.unwrap();
    store.save_instance(running).await.unwrap();
    store.save_instance(other).await.unwrap();

    assert_eq!(store.list_instances_by_user("user-1").await.unwrap().len(), 2);
    assert_eq!(store.list_instances_by_user("user-2").await.unwrap().len(), 1);

    let now = chrono::Utc::now();
    let window = store
        .list_instances_completed_between(now - chrono::Duration::hours(1), now)
        .await
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].id, done.id);
    assert!(store
        .list_instances_completed_between(now - chrono::Duration::hours(2), now - chrono::Duration::hours(1))
        .await
        .unwrap()
        .is_empty());

    let mut overdue = workflow_engine::workflow::StepExecution::new(&done.id, "task", "Task");
    overdue.start().unwrap();
    overdue.time_out("Step task timed out after 300 seconds").unwrap();
    store.save_step_execution(overdue.clone()).await.unwrap();

    let monitor = WorkflowMonitor::new(store.clone());
    let timed_out = monitor.timed_out_step_executions().await.unwrap();
    assert_eq!(timed_out.len(), 1);
    assert_eq!(timed_out[0].id, overdue.id);
    assert_eq!(timed_out[0].status, StepStatus::TimedOut);
}
