//! Explicit token-by-token decoding loop
//!
//! Each step asks the model for logits, samples one token (masked by the
//! speaker trie when it is active), appends it and checks the stop
//! conditions. Stopping is a return value, never an unwind.

use crate::boundary;
use crate::error::ModelError;
use crate::model::{LanguageModel, TokenId};
use crate::sampling::Sampler;
use crate::trie::CharacterTrie;

/// Why a decode call stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A newline closed a non-empty line
    EndOfLine,
    /// Sentence punctuation in sentence mode
    EndOfSentence,
    /// Per-call token budget used up
    MaxTokens,
    /// Model context is full
    ContextFull,
}

impl StopReason {
    /// Did the model itself close the segment?
    #[inline]
    #[must_use]
    pub fn is_boundary(self) -> bool {
        matches!(self, Self::EndOfLine | Self::EndOfSentence)
    }
}

/// Per-call decoding switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Token budget of this call
    pub max_tokens: usize,
    /// Stop at sentence punctuation as well as at newlines
    pub sentence_mode: bool,
    /// Earlier segments of this line were already accepted
    pub line_in_progress: bool,
    /// The context ends at a line start, so the speaker trie applies
    pub at_line_start: bool,
}

/// Result of one decode call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Generated tokens only
    pub tokens: Vec<TokenId>,
    /// Generated tokens, decoded
    pub text: String,
    /// Why decoding stopped
    pub stop: StopReason,
}

/// Drives a model one token at a time
pub struct LineDecoder<'a, M: LanguageModel + ?Sized> {
    model: &'a mut M,
    sampler: &'a mut Sampler,
}

impl<'a, M: LanguageModel + ?Sized> LineDecoder<'a, M> {
    /// Borrow a model and a sampler for one or more decode calls
    pub fn new(model: &'a mut M, sampler: &'a mut Sampler) -> Self {
        Self { model, sampler }
    }

    /// Generate until a boundary, the token budget or the context limit
    ///
    /// # Errors
    /// - `ModelError::Inference` from the model
    /// - `ModelError::EmptyDistribution` if masking left nothing to sample
    pub fn generate(
        &mut self,
        prompt: &[TokenId],
        options: DecodeOptions,
        mut trie: Option<&mut CharacterTrie>,
    ) -> Result<Decoded, ModelError> {
        let max_context = self.model.max_context();
        let mut context = prompt.to_vec();
        let mut generated: Vec<TokenId> = Vec::new();

        self.model.start_sequence(&context);
        if let Some(trie) = trie.as_deref_mut() {
            if options.at_line_start && !options.line_in_progress {
                trie.begin_line();
            }
        }

        let stop = loop {
            if generated.len() >= options.max_tokens {
                break StopReason::MaxTokens;
            }
            if context.len() >= max_context {
                break StopReason::ContextFull;
            }

            let logits = self.model.next_token_logits(&context)?;
            let allowed = trie.as_deref().and_then(CharacterTrie::weighted_allowed);
            let token = self
                .sampler
                .sample(&logits, &context, allowed.as_ref())
                .ok_or(ModelError::EmptyDistribution)?;

            context.push(token);
            generated.push(token);

            let piece = self.model.detokenize(&[token]);
            if let Some(trie) = trie.as_deref_mut() {
                if trie.is_active() {
                    trie.advance(token);
                } else if piece.ends_with('\n') {
                    trie.begin_line();
                }
            }

            let text = self.model.detokenize(&generated);
            if options.sentence_mode && boundary::is_end_of_sentence(&piece, &text) {
                break StopReason::EndOfSentence;
            }
            if boundary::is_end_of_line(&text, options.line_in_progress) {
                break StopReason::EndOfLine;
            }
        };

        let text = self.model.detokenize(&generated);
        tracing::trace!("Decoded {} tokens, stop: {:?}", generated.len(), stop);
        Ok(Decoded {
            tokens: generated,
            text,
            stop,
        })
    }
}
