//! Agent assignment for TASK steps.
//!
//! The engine only needs an agent id for a required role. Real deployments
//! plug in a collaboration service; the static assigner hands every task to
//! one fixed identity.

use async_trait::async_trait;
use tracing::debug;

use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentAssigner: Send + Sync {
    /// Pick the agent that should take a step requiring `required_role`.
    async fn assign_best_agent(&self, required_role: Option<String>) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct StaticAgentAssigner {
    agent_id: String,
}

impl StaticAgentAssigner {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

impl Default for StaticAgentAssigner {
    fn default() -> Self {
        Self::new("system-agent")
    }
}

#[async_trait]
impl AgentAssigner for StaticAgentAssigner {
    async fn assign_best_agent(&self, required_role: Option<String>) -> Result<String> {
        debug!(
            "Assigning {} for role {}",
            self.agent_id,
            required_role.as_deref().unwrap_or("<any>")
        );
        Ok(self.agent_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_assigner_ignores_role() {
        let assigner = StaticAgentAssigner::default();
        assert_eq!(
            assigner.assign_best_agent(Some("reviewer".to_string())).await.unwrap(),
            "system-agent"
        );
        assert_eq!(assigner.assign_best_agent(None).await.unwrap(), "system-agent");
    }
}
