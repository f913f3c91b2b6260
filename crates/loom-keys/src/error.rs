//! Key codec errors

/// Errors produced while decoding a key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Key fails [`crate::validate`]
    #[error("invalid key: {0}")]
    Invalid(String),

    /// Path does not tokenize into letters and commands
    #[error("malformed key {key}: {reason}")]
    Malformed {
        /// Offending path
        key: String,
        /// What went wrong
        reason: String,
    },

    /// Run-length prefix too large to expand
    #[error("run length {run} exceeds limit {limit}")]
    RunTooLong {
        /// Digits as written
        run: String,
        /// Largest accepted run
        limit: usize,
    },

    /// Scene title normalizes to nothing
    #[error("scene id is empty after normalization")]
    EmptySceneId,
}

impl KeyError {
    #[inline]
    pub(crate) fn malformed(key: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
