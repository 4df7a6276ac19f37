//! Error types for evoloop-state

use thiserror::Error;

/// Errors that can occur in the case persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Case directory or record already exists
    #[error("Case already exists: {0}")]
    CaseExists(String),

    /// Case not found in the archive
    #[error("Case not found: {0}")]
    CaseNotFound(String),

    /// Iteration arrived with an index that would break the gapless sequence
    #[error("Iteration out of order for case {case_id}: expected {expected}, got {actual}")]
    OutOfOrder {
        case_id: String,
        expected: u32,
        actual: u32,
    },

    /// Case was already finalized and accepts no further iterations
    #[error("Case already finalized: {0}")]
    AlreadyFinalized(String),

    /// Metadata digest does not match the stored content
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}
