//! Loom Decode: constrained line generation
//!
//! Turns a dialogue prompt into the next line, one token at a time:
//! - [`decoder`]: explicit decode loop with line and sentence stops
//! - [`trie`]: speaker-name constraint for line starts
//! - [`sampling`]: seeded top-k / top-p sampling
//! - [`worker`]: retries, entailment checks, outline remarks, summarization
//! - [`handle`]: the worker thread and the [`GenerationBackend`] seam

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod boundary;
pub mod config;
pub mod decoder;
pub mod error;
pub mod handle;
pub mod lines;
pub mod model;
pub mod sampling;
pub mod trie;
pub mod types;
pub mod worker;

pub use config::{GenerationConfig, OutlinePolicy, SamplingParams};
pub use decoder::{DecodeOptions, Decoded, LineDecoder, StopReason};
pub use error::{GenerationError, ModelError};
pub use handle::{GenerationBackend, WorkerHandle, WorkerMessage};
pub use lines::{extract_character_names, join_lines, looks_scenic, shorten};
pub use model::{EntailmentScorer, LanguageModel, Summarizer, TokenId};
pub use sampling::{seed_for_key, Sampler};
pub use trie::{CharacterTrie, TrieStep};
pub use types::{GenerationOutcome, GenerationRequest, OutlineHint};
pub use worker::GenerationWorker;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
