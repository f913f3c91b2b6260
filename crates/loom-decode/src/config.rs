//! Generation parameters
//!
//! Every field has a default so a partial `[generation]` table in the daemon's
//! config file is enough.

use serde::{Deserialize, Serialize};

/// Sampling knobs applied at every decoding step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Softmax temperature; `0.0` means greedy
    pub temperature: f32,
    /// Nucleus cutoff
    pub top_p: f32,
    /// Keep only the k most likely tokens; `0` disables
    pub top_k: usize,
    /// Penalty for tokens already in the context; `1.0` disables
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
            top_k: 50,
            repetition_penalty: 1.2,
        }
    }
}

/// When an outline remark gets injected
///
/// The chance grows with the number of lines written since the last remark:
/// a remark goes in when `u * (2^n - 1) / scale > threshold` for a uniform
/// `u` in `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlinePolicy {
    /// Divisor of the exponential term
    pub scale: f64,
    /// Acceptance threshold
    pub threshold: f64,
}

impl Default for OutlinePolicy {
    fn default() -> Self {
        Self {
            scale: 10.0,
            threshold: 0.6,
        }
    }
}

impl OutlinePolicy {
    /// Decide with a given uniform draw
    #[must_use]
    pub fn should_insert(&self, lines_since_remark: u32, draw: f64) -> bool {
        let exponent = i32::try_from(lines_since_remark.min(64)).unwrap_or(64);
        let growth = 2f64.powi(exponent) - 1.0;
        draw * growth / self.scale > self.threshold
    }
}

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Sampling knobs
    pub sampling: SamplingParams,
    /// Token budget of a single decode call
    pub max_new_tokens: usize,
    /// Rejected attempts tolerated before the best one is accepted
    pub max_retries: u32,
    /// Minimum entailment score of an accepted line
    pub nli_threshold: f32,
    /// Sentence fragments accumulated before a line is forced out (prose mode)
    pub max_sentences: usize,
    /// Reject a stage direction right after another stage direction
    pub ban_remarks: bool,
    /// Prose mode: stop at sentence ends, no speaker colons
    pub prose: bool,
    /// Restrict line starts to speakers already in the prompt
    pub limit_characters: bool,
    /// Base of the speaker preference weight
    pub history_coefficient: f32,
    /// Outline remark injection
    pub outline: OutlinePolicy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            max_new_tokens: 100,
            max_retries: 10,
            nli_threshold: 0.40,
            max_sentences: 5,
            ban_remarks: true,
            prose: false,
            limit_characters: false,
            history_coefficient: 2.0,
            outline: OutlinePolicy::default(),
        }
    }
}

impl GenerationConfig {
    /// Builder: set retry budget
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder: set entailment threshold
    #[inline]
    #[must_use]
    pub fn with_nli_threshold(mut self, threshold: f32) -> Self {
        self.nli_threshold = threshold;
        self
    }

    /// Builder: switch prose mode
    #[inline]
    #[must_use]
    pub fn with_prose(mut self, prose: bool) -> Self {
        self.prose = prose;
        self
    }

    /// Builder: switch speaker restriction
    #[inline]
    #[must_use]
    pub fn with_limit_characters(mut self, limit: bool) -> Self {
        self.limit_characters = limit;
        self
    }

    /// Builder: set per-call token budget
    #[inline]
    #[must_use]
    pub fn with_max_new_tokens(mut self, tokens: usize) -> Self {
        self.max_new_tokens = tokens;
        self
    }

    /// Builder: set sampling knobs
    #[inline]
    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Builder: set outline policy
    #[inline]
    #[must_use]
    pub fn with_outline(mut self, outline: OutlinePolicy) -> Self {
        self.outline = outline;
        self
    }
}
