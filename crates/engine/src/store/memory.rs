use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    store::Store,
    workflow::{
        ExecutionContext, StepExecution, StepStatus, WorkflowDefinition, WorkflowInstance,
        WorkflowStatus,
    },
    Error, Result,
};

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    instances: RwLock<HashMap<String, WorkflowInstance>>,
    // Kept in creation order
    step_executions: RwLock<Vec<StepExecution>>,
    contexts: RwLock<HashMap<String, ExecutionContext>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        debug!("Saving workflow definition: {}", definition.id);
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.definitions.read().await.get(id).cloned())
    }

    async fn delete_definition(&self, id: &str) -> Result<()> {
        self.definitions.write().await.remove(id);
        Ok(())
    }

    async fn list_definitions(&self, active_only: bool) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions: Vec<_> = self
            .definitions
            .read()
            .await
            .values()
            .filter(|d| !active_only || d.is_active)
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(definitions)
    }

    async fn save_instance(&self, instance: WorkflowInstance) -> Result<()> {
        debug!("Saving workflow instance: {} ({})", instance.id, instance.status);
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        self.instances.write().await.remove(id);
        self.contexts.write().await.remove(id);
        self.step_executions
            .write()
            .await
            .retain(|e| e.workflow_instance_id != id);
        Ok(())
    }

    async fn list_instances(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowInstance>> {
        let mut instances: Vec<_> = self.instances.read().await.values().cloned().collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_instances_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn list_instances_by_definition(&self, definition_id: &str) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.workflow_definition_id == definition_id)
            .cloned()
            .collect())
    }

    async fn list_instances_by_user(&self, user_id: &str) -> Result<Vec<WorkflowInstance>> {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }

    async fn list_instances_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>> {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status == WorkflowStatus::Completed)
            .filter(|i| i.completed_at.map_or(false, |at| start <= at && at <= end))
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.completed_at);
        Ok(instances)
    }

    async fn save_step_execution(&self, execution: StepExecution) -> Result<()> {
        debug!(
            "Saving step execution: {} ({} -> {})",
            execution.id, execution.step_id, execution.status
        );
        let mut executions = self.step_executions.write().await;
        match executions.iter_mut().find(|e| e.id == execution.id) {
            Some(existing) => *existing = execution,
            None => executions.push(execution),
        }
        Ok(())
    }

    async fn get_step_execution(&self, id: &str) -> Result<Option<StepExecution>> {
        Ok(self
            .step_executions
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn find_step_executions_by_status(
        &self,
        instance_id: &str,
        status: StepStatus,
    ) -> Result<Vec<StepExecution>> {
        Ok(self
            .step_executions
            .read()
            .await
            .iter()
            .filter(|e| e.workflow_instance_id == instance_id && e.status == status)
            .cloned()
            .collect())
    }

    async fn list_step_executions(&self, instance_id: &str) -> Result<Vec<StepExecution>> {
        Ok(self
            .step_executions
            .read()
            .await
            .iter()
            .filter(|e| e.workflow_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_step_executions_by_status(&self, status: StepStatus) -> Result<Vec<StepExecution>> {
        Ok(self
            .step_executions
            .read()
            .await
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn get_execution_context(&self, instance_id: &str) -> Result<Option<ExecutionContext>> {
        Ok(self.contexts.read().await.get(instance_id).cloned())
    }

    async fn save_execution_context(
        &self,
        context: ExecutionContext,
        expected_version: Option<i64>,
    ) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        if let Some(expected) = expected_version {
            let stored = contexts.get(&context.workflow_instance_id).map(|c| c.version);
            if stored != Some(expected) {
                return Err(Error::VersionConflict(format!(
                    "Execution context for {} is at version {:?}, expected {}",
                    context.workflow_instance_id, stored, expected
                )));
            }
        }
        contexts.insert(context.workflow_instance_id.clone(), context);
        Ok(())
    }
}
