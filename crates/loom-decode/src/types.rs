//! Messages crossing the worker boundary

use serde::{Deserialize, Serialize};

/// Next outline remark and how long ago the last one was placed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineHint {
    /// Remark to maybe inject before the generated line
    pub next_remark: Option<String>,
    /// Lines written since the previous outline remark
    pub lines_since_remark: u32,
}

/// One generation job as seen by the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Full expanded key; its path seeds the RNG
    pub key: String,
    /// Scene prompt followed by the resolved lines
    pub prompt: String,
    /// Stripped lines that must not come out again
    pub forbidden: Vec<String>,
    /// Outline state for remark injection
    pub outline: OutlineHint,
}

impl GenerationRequest {
    /// Create a request without forbidden lines or outline
    #[must_use]
    pub fn new(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prompt: prompt.into(),
            forbidden: Vec::new(),
            outline: OutlineHint::default(),
        }
    }

    /// Builder: set forbidden lines
    #[inline]
    #[must_use]
    pub fn with_forbidden(mut self, forbidden: Vec<String>) -> Self {
        self.forbidden = forbidden;
        self
    }

    /// Builder: set outline hint
    #[inline]
    #[must_use]
    pub fn with_outline(mut self, outline: OutlineHint) -> Self {
        self.outline = outline;
        self
    }
}

/// Lines produced for one request
///
/// One line for the requested key, preceded by an injected outline remark
/// when one was placed. The remark is stored at the requested key and the
/// line at the key followed by `a`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// Generated lines, in order
    pub lines: Vec<String>,
    /// Name of the model that wrote them
    pub model: String,
}
