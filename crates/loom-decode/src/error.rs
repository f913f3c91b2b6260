//! Error types for decoding and the generation worker

/// Failures raised by a model backend or one of its helper collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Forward pass failed
    #[error("inference failed: {0}")]
    Inference(String),

    /// Every candidate token was masked out
    #[error("no token left to sample from")]
    EmptyDistribution,

    /// Entailment scorer failed
    #[error("scoring failed: {0}")]
    Scoring(String),

    /// Summarizer failed
    #[error("summarization failed: {0}")]
    Summarization(String),
}

/// Errors delivered to the waiters of a generation job
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Backend raised an error while generating
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Model could not be loaded
    #[error("model load failed: {0}")]
    LoadFailed(String),

    /// Worker thread is gone (crashed during load or shut down)
    #[error("generation worker unavailable")]
    WorkerUnavailable,

    /// Generation panicked inside the worker
    #[error("generation panicked: {0}")]
    Panicked(String),
}

impl GenerationError {
    /// Check if a later attempt might succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Model(_) | Self::Panicked(_))
    }
}
