//! Engine error taxonomy.
//!
//! Execution and producer failures are not errors at this level: they become
//! failed `ExecutionOutcome`s and are retried by the regeneration controller.

use evoloop_state::StateError;

/// Evoloop engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EvoError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("case not found: {0}")]
    CaseNotFound(String),

    #[error("case already exists: {0}")]
    CaseExists(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("code producer failed: {0}")]
    Producer(String),

    #[error("text generation failed: {0}")]
    Generation(String),

    #[error("data source error: {0}")]
    DataSource(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StateError> for EvoError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::CaseExists(id) => EvoError::CaseExists(id),
            StateError::CaseNotFound(id) => EvoError::CaseNotFound(id),
            StateError::Io(e) => EvoError::Io(e),
            other => EvoError::Archive(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EvoError {
    fn from(err: serde_json::Error) -> Self {
        EvoError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EvoError {
    fn from(err: toml::de::Error) -> Self {
        EvoError::InvalidConfig(err.to_string())
    }
}

impl From<reqwest::Error> for EvoError {
    fn from(err: reqwest::Error) -> Self {
        EvoError::Generation(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EvoError>;
