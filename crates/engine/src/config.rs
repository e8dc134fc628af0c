use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::store::{DatabaseConfig, DatabaseType};

/// What the engine does when it reaches a TASK step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskCompletionMode {
    /// Assign, start and complete the task immediately, then advance
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// Assign and start the task, then wait for `report_step_completion`
    #[serde(rename = "external")]
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub default_agent_id: String,
    #[serde(default)]
    pub task_completion: TaskCompletionMode,
    /// Fail the instance when a step fails, instead of leaving it RUNNING
    pub escalate_step_failures: bool,
    /// How many times one instance may be routed to an error handling step
    pub max_error_handler_hops: u32,
    /// Evaluate CONDITIONAL transition expressions against the context
    pub evaluate_conditions: bool,
    pub context_update_retries: u32,
    /// Seconds between timeout sweeps; zero disables the sweeper
    pub timeout_sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            default_agent_id: "system-agent".to_string(),
            task_completion: TaskCompletionMode::Auto,
            escalate_step_failures: false,
            max_error_handler_hops: 10,
            evaluate_conditions: false,
            context_update_retries: 3,
            timeout_sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = EngineConfig::default();

        let config = Config {
            database: DatabaseConfig {
                db_type: match std::env::var("DATABASE_TYPE")
                    .unwrap_or_else(|_| "memory".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "sqlite" => DatabaseType::Sqlite,
                    _ => DatabaseType::Memory,
                },
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok()
                    .or_else(|| Some(PathBuf::from("data/workflow-engine.db"))),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            engine: EngineConfig {
                queue_capacity: env_parse("ENGINE_QUEUE_CAPACITY", defaults.queue_capacity),
                default_agent_id: std::env::var("ENGINE_DEFAULT_AGENT_ID")
                    .unwrap_or(defaults.default_agent_id),
                task_completion: match std::env::var("ENGINE_TASK_COMPLETION")
                    .unwrap_or_else(|_| "auto".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "external" => TaskCompletionMode::External,
                    _ => TaskCompletionMode::Auto,
                },
                escalate_step_failures: env_flag(
                    "ENGINE_ESCALATE_STEP_FAILURES",
                    defaults.escalate_step_failures,
                ),
                max_error_handler_hops: env_parse(
                    "ENGINE_MAX_ERROR_HANDLER_HOPS",
                    defaults.max_error_handler_hops,
                ),
                evaluate_conditions: env_flag(
                    "ENGINE_EVALUATE_CONDITIONS",
                    defaults.evaluate_conditions,
                ),
                context_update_retries: env_parse(
                    "ENGINE_CONTEXT_UPDATE_RETRIES",
                    defaults.context_update_retries,
                ),
                timeout_sweep_interval_secs: env_parse(
                    "ENGINE_TIMEOUT_SWEEP_SECS",
                    defaults.timeout_sweep_interval_secs,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.database.validate().map_err(crate::Error::Config)?;

        if self.engine.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "ENGINE_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        if self.engine.default_agent_id.is_empty() {
            tracing::warn!("ENGINE_DEFAULT_AGENT_ID is empty. Tasks will be assigned to an anonymous agent.");
        }

        Ok(())
    }
}
