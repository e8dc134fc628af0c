use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::info;

use crate::{
    workflow::{ExecutionContext, StepType, WorkflowStep},
    Error, Result,
};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").unwrap();
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub output: Value,
    pub success: bool,
}

/// Runs the side effect of NOTIFICATION, INTEGRATION and SUBPROCESS steps.
///
/// An `Err` or a result with `success: false` counts as a failed attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn execute_step(&self, step: &WorkflowStep, context: &ExecutionContext) -> Result<StepResult>;
}

/// Notifications, integrations and subprocesses are simulated: the rendered
/// request is logged and echoed back as the step output.
#[derive(Debug, Default)]
pub struct StepExecutor;

#[async_trait]
impl StepRunner for StepExecutor {
    async fn execute_step(&self, step: &WorkflowStep, context: &ExecutionContext) -> Result<StepResult> {
        match &step.step_type {
            StepType::Notification => self.execute_notification_step(step, context).await,
            StepType::Integration => self.execute_integration_step(step, context).await,
            StepType::Subprocess => self.execute_subprocess_step(step, context).await,
            other => Err(Error::StepDispatch(format!(
                "Step type {} has no side effect to execute",
                other
            ))),
        }
    }
}

impl StepExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn execute_notification_step(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
    ) -> Result<StepResult> {
        let channel = step.parameter_str("channel").unwrap_or("log");
        let template = step
            .parameter_str("message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Notification: {}", step.name));
        let message = self.render_template(&template, context);

        info!("Notification [{}] for step {}: {}", channel, step.id, message);

        Ok(StepResult {
            output: serde_json::json!({
                "channel": channel,
                "message": message,
                "recipients": step.parameters.get("recipients").cloned().unwrap_or(Value::Null),
            }),
            success: true,
        })
    }

    async fn execute_integration_step(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
    ) -> Result<StepResult> {
        let system = step.parameter_str("system").unwrap_or("external");
        let endpoint = step
            .parameter_str("endpoint")
            .map(|e| self.render_template(e, context));

        info!(
            "Integration call to {} for step {} (endpoint: {})",
            system,
            step.id,
            endpoint.as_deref().unwrap_or("-")
        );

        Ok(StepResult {
            output: serde_json::json!({
                "system": system,
                "endpoint": endpoint,
                "status": "simulated",
            }),
            success: true,
        })
    }

    async fn execute_subprocess_step(
        &self,
        step: &WorkflowStep,
        _context: &ExecutionContext,
    ) -> Result<StepResult> {
        let child = step.parameter_str("workflowDefinitionId");

        info!(
            "Subprocess for step {} (definition: {})",
            step.id,
            child.unwrap_or("-")
        );

        Ok(StepResult {
            output: serde_json::json!({
                "workflowDefinitionId": child,
                "started": false,
            }),
            success: true,
        })
    }

    /// Replace `{{path}}` placeholders with values from the context.
    /// Unresolved placeholders are left as written.
    pub fn render_template(&self, template: &str, context: &ExecutionContext) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures| {
                match context.resolve(&caps[1]) {
                    Some(Value::String(s)) => s,
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut context = ExecutionContext::new("instance-1");
        context.put("customer", json!({ "name": "Ada", "tier": 2 }));
        context
    }

    #[test]
    fn test_render_template() {
        let executor = StepExecutor::new();
        let ctx = context();
        assert_eq!(
            executor.render_template("Hello {{ customer.name }} (tier {{customer.tier}})", &ctx),
            "Hello Ada (tier 2)"
        );
        assert_eq!(
            executor.render_template("Missing {{ nope }} stays", &ctx),
            "Missing {{ nope }} stays"
        );
    }

    #[tokio::test]
    async fn test_notification_renders_message() {
        let executor = StepExecutor::new();
        let step = WorkflowStep::new("n", "Notify", StepType::Notification)
            .with_parameter("message", json!("Order for {{ customer.name }} ready"))
            .with_parameter("channel", json!("email"));

        let result = executor.execute_step(&step, &context()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["message"], "Order for Ada ready");
        assert_eq!(result.output["channel"], "email");
    }

    #[tokio::test]
    async fn test_integration_and_subprocess_are_simulated() {
        let executor = StepExecutor::new();
        let integration = WorkflowStep::new("i", "Sync CRM", StepType::Integration)
            .with_parameter("system", json!("crm"));
        let result = executor.execute_step(&integration, &context()).await.unwrap();
        assert_eq!(result.output["status"], "simulated");

        let subprocess = WorkflowStep::new("s", "Child", StepType::Subprocess)
            .with_parameter("workflowDefinitionId", json!("child-def"));
        let result = executor.execute_step(&subprocess, &context()).await.unwrap();
        assert_eq!(result.output["workflowDefinitionId"], "child-def");
    }

    #[tokio::test]
    async fn test_other_step_types_are_rejected() {
        let executor = StepExecutor::new();
        let step = WorkflowStep::new("t", "Task", StepType::Task);
        let err = executor.execute_step(&step, &context()).await.unwrap_err();
        assert!(matches!(err, Error::StepDispatch(_)));
    }
}
