pub mod agent;
pub mod config;
pub mod metrics;
pub mod monitor;
pub mod store;
pub mod workflow;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Step dispatch failure: {0}")]
    StepDispatch(String),
    #[error("Version conflict: {0}")]
    VersionConflict(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the errors a caller should map to "does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Error::StateConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_their_category() {
        let err = Error::NotFound("workflow instance abc".to_string());
        assert_eq!(err.to_string(), "Not found: workflow instance abc");
        assert!(err.is_not_found());

        let err = Error::StateConflict("instance is COMPLETED".to_string());
        assert!(err.is_state_conflict());
        assert!(!err.is_not_found());
    }
}
