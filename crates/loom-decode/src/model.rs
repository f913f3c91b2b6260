//! Collaborator interfaces: language model, entailment scorer, summarizer
//!
//! The model is a black box that maps a token context to next-token logits.
//! Decoding, sampling and stopping are owned by [`crate::decoder`].

use crate::error::ModelError;

/// Token id in the model's vocabulary
pub type TokenId = u32;

/// Causal language model driven one token at a time
///
/// Implementations are not required to be re-entrant; the worker never calls
/// one concurrently with itself.
pub trait LanguageModel: Send {
    /// Name recorded next to every stored line
    fn name(&self) -> &str;

    /// Encode text with the model's own tokenizer
    fn tokenize(&self, text: &str) -> Vec<TokenId>;

    /// Decode tokens back to text
    fn detokenize(&self, tokens: &[TokenId]) -> String;

    /// Number of logits returned per step
    fn vocab_size(&self) -> usize;

    /// Longest context (prompt + generated) the model accepts
    fn max_context(&self) -> usize;

    /// A new sequence starts; drop any cached state for the previous one
    fn start_sequence(&mut self, _prompt: &[TokenId]) {}

    /// Logits for the token following `context`
    ///
    /// # Errors
    /// Returns `ModelError::Inference` if the forward pass fails.
    fn next_token_logits(&mut self, context: &[TokenId]) -> Result<Vec<f32>, ModelError>;

    /// Failure recorded by one of the infallible calls since the last check
    ///
    /// `tokenize`, `detokenize` and `start_sequence` cannot return errors;
    /// backends that can fail there keep the failure and hand it out here so
    /// the worker fails the job instead of keeping an empty result.
    fn take_failure(&mut self) -> Option<ModelError> {
        None
    }
}

/// Entailment ("NLI") scorer: how acceptable is `hypothesis` after `premise`
pub trait EntailmentScorer: Send {
    /// Score in `[0, 1]`
    ///
    /// # Errors
    /// Returns `ModelError::Scoring` on backend failure.
    fn score(&mut self, premise: &str, hypothesis: &str) -> Result<f32, ModelError>;
}

/// Shortens a prompt that no longer fits the model context
pub trait Summarizer: Send {
    /// Summarize a dialogue prompt
    ///
    /// # Errors
    /// Returns `ModelError::Summarization` on backend failure.
    fn summarize(&mut self, text: &str) -> Result<String, ModelError>;
}
