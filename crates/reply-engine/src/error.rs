//! Error taxonomy shared by every engine component.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Backend error or deadline overrun. Never retried inside the same cycle.
    #[error("generation failed: {0}")]
    TransientGenerationFailure(String),

    /// Persisted state could not be decoded; callers fall back to empty state.
    #[error("persisted state is unreadable: {0}")]
    StateCorruption(String),

    /// Explicit stop or deadline. Cleanup still runs on this path.
    #[error("operation cancelled: {0}")]
    CancelledOperation(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::CancelledOperation(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        EngineError::Storage(format!("connection pool: {}", e))
    }
}
