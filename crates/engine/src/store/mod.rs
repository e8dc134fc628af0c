mod config;
mod factory;
mod memory;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::workflow::{
    ExecutionContext, StepExecution, StepStatus, WorkflowDefinition, WorkflowInstance,
    WorkflowStatus,
};

#[async_trait]
pub trait Store: Send + Sync {
    // Initialize storage schema
    async fn init(&self) -> crate::Result<()>;

    // Workflow definition operations
    async fn save_definition(&self, definition: WorkflowDefinition) -> crate::Result<()>;
    async fn get_definition(&self, id: &str) -> crate::Result<Option<WorkflowDefinition>>;
    async fn delete_definition(&self, id: &str) -> crate::Result<()>;
    async fn list_definitions(&self, active_only: bool) -> crate::Result<Vec<WorkflowDefinition>>;

    // Workflow instance operations
    async fn save_instance(&self, instance: WorkflowInstance) -> crate::Result<()>;
    async fn get_instance(&self, id: &str) -> crate::Result<Option<WorkflowInstance>>;
    async fn delete_instance(&self, id: &str) -> crate::Result<()>;
    async fn list_instances(&self, limit: i64, offset: i64) -> crate::Result<Vec<WorkflowInstance>>;
    async fn list_instances_by_status(&self, status: WorkflowStatus) -> crate::Result<Vec<WorkflowInstance>>;
    async fn list_instances_by_definition(&self, definition_id: &str) -> crate::Result<Vec<WorkflowInstance>>;
    async fn list_instances_by_user(&self, user_id: &str) -> crate::Result<Vec<WorkflowInstance>>;
    /// COMPLETED instances whose `completed_at` falls within `[start, end]`, oldest first
    async fn list_instances_completed_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> crate::Result<Vec<WorkflowInstance>>;

    // Step execution operations
    async fn save_step_execution(&self, execution: StepExecution) -> crate::Result<()>;
    async fn get_step_execution(&self, id: &str) -> crate::Result<Option<StepExecution>>;
    async fn find_step_executions_by_status(&self, instance_id: &str, status: StepStatus) -> crate::Result<Vec<StepExecution>>;
    /// All executions of an instance in creation order
    async fn list_step_executions(&self, instance_id: &str) -> crate::Result<Vec<StepExecution>>;
    async fn list_step_executions_by_status(&self, status: StepStatus) -> crate::Result<Vec<StepExecution>>;

    // Execution context operations
    async fn get_execution_context(&self, instance_id: &str) -> crate::Result<Option<ExecutionContext>>;
    /// Insert or overwrite when `expected_version` is `None`. Otherwise the
    /// stored version must equal `expected_version` or `Error::VersionConflict` is returned.
    async fn save_execution_context(&self, context: ExecutionContext, expected_version: Option<i64>) -> crate::Result<()>;
}
