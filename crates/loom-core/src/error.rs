//! Error types for the loom core
//!
//! Provides error handling for:
//! - Key validation failures (rejected before any resolution work)
//! - Missing scenes and exhausted insertion retries
//! - Generation failures delivered to the waiters of a job
//! - Malformed commands and storage failures

use loom_decode::GenerationError;
use loom_keys::KeyError;

/// Main error type returned by every command
#[derive(Debug, thiserror::Error)]
pub enum LoomError {
    /// Key failed validation or could not be parsed
    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    /// Referenced scene does not exist
    #[error("scene not found: {0}")]
    SceneNotFound(String),

    /// Scene id suffixes exhausted
    #[error("too many scenes named {0}")]
    TooManyCollisions(String),

    /// All 26 human-input letters are taken under this key
    #[error("too many human inputs at {0}")]
    TooManyHumanInputs(String),

    /// Model or backend failed while generating
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Unknown verb or bad arguments
    #[error("malformed request: {0}")]
    RequestMalformed(String),

    /// Token check failed
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Scheduler stopped before the result arrived
    #[error("server is shutting down")]
    ShuttingDown,

    /// Storage failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LoomError {
    /// Check if the error was caused by the request itself
    #[inline]
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey(_)
                | Self::SceneNotFound(_)
                | Self::TooManyCollisions(_)
                | Self::TooManyHumanInputs(_)
                | Self::RequestMalformed(_)
                | Self::Unauthorized(_)
        )
    }
}

impl From<GenerationError> for LoomError {
    fn from(err: GenerationError) -> Self {
        Self::GenerationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for LoomError {
    fn from(err: serde_json::Error) -> Self {
        Self::RequestMalformed(err.to_string())
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failure
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Store could not be opened
    #[error("cannot open store at {path}: {reason}")]
    Open {
        /// Database path
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Blocking store call panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(String),
}

/// Result alias for loom operations
pub type LoomResult<T> = Result<T, LoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(LoomError::SceneNotFound("x".to_string()).is_client_error());
        assert!(LoomError::InvalidKey(KeyError::Invalid("x-1".to_string())).is_client_error());
        assert!(!LoomError::ShuttingDown.is_client_error());
        assert!(!LoomError::GenerationFailed("oom".to_string()).is_client_error());
    }

    #[test]
    fn generation_error_keeps_message() {
        let err = LoomError::from(GenerationError::WorkerUnavailable);
        assert_eq!(err.to_string(), "generation failed: generation worker unavailable");
    }
}
