pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod instance;
pub mod state;
pub mod step;

pub use condition::{ConditionEvaluator, PathConditionEvaluator};
pub use context::ExecutionContext;
pub use definition::{StepType, TransitionType, WorkflowDefinition, WorkflowStep, WorkflowTransition};
pub use engine::{StepOutcome, WorkflowEngine};
pub use executor::{StepExecutor, StepResult, StepRunner};
pub use instance::WorkflowInstance;
pub use state::{StepStatus, WorkflowStatus};
pub use step::StepExecution;

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
