//! Testing utilities for the loom workspace
//!
//! Shared doubles for the generation stack:
//! - [`ScriptedModel`]: a character-level model that spells out fixed text
//! - [`ScriptedScorer`], [`FixedSummarizer`]: entailment and summary doubles
//! - [`CountingBackend`]: a [`GenerationBackend`] that records every call
//! - [`DEMO_PROMPT`], [`DEMO_OUTLINE`]: scene fixtures

#![allow(missing_docs)]

use async_trait::async_trait;
use loom_decode::{
    EntailmentScorer, GenerationBackend, GenerationError, GenerationOutcome, GenerationRequest, LanguageModel,
    ModelError, SamplingParams, Summarizer, TokenId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Prompt of the `demo` scene
pub const DEMO_PROMPT: &str = "A room.\n\nMan: Hello.";

/// Two-beat outline for outline tests
pub const DEMO_OUTLINE: &str = "A woman enters.\nThey argue.";

const NEWLINE: TokenId = 0;
const SCRIPT_LOGIT: f32 = 20.0;

/// Greedy sampling, so scripted text comes out exactly
#[must_use]
pub fn greedy() -> SamplingParams {
    SamplingParams {
        temperature: 0.0,
        top_p: 1.0,
        top_k: 0,
        repetition_penalty: 1.0,
    }
}

/// Character-level model over `\n` plus printable ASCII
///
/// Every decode call (every `start_sequence`) takes the next script and the
/// model then spells it out one character at a time, followed by newlines.
/// Once the scripts run out the last one repeats.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    name: String,
    scripts: VecDeque<String>,
    current: Vec<char>,
    position: usize,
    max_context: usize,
    fail: bool,
    panic: bool,
    contexts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(scripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "scripted".to_string(),
            scripts: scripts.into_iter().map(Into::into).collect(),
            current: Vec::new(),
            position: 0,
            max_context: 1024,
            fail: false,
            panic: false,
            contexts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    #[must_use]
    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }

    /// Every forward pass fails
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Every forward pass panics
    #[must_use]
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    /// Decoded contexts seen at the start of each decode call
    #[must_use]
    pub fn contexts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.contexts)
    }

    fn char_to_token(c: char) -> TokenId {
        match c {
            '\n' => NEWLINE,
            ' '..='~' => c as TokenId - 0x1f,
            _ => '?' as TokenId - 0x1f,
        }
    }

    fn token_to_char(token: TokenId) -> char {
        if token == NEWLINE {
            return '\n';
        }
        char::from_u32(token + 0x1f).unwrap_or('?')
    }
}

impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.chars().map(Self::char_to_token).collect()
    }

    fn detokenize(&self, tokens: &[TokenId]) -> String {
        tokens.iter().map(|&t| Self::token_to_char(t)).collect()
    }

    fn vocab_size(&self) -> usize {
        96
    }

    fn max_context(&self) -> usize {
        self.max_context
    }

    fn start_sequence(&mut self, prompt: &[TokenId]) {
        self.contexts.lock().push(self.detokenize(prompt));
        let next = if self.scripts.len() > 1 {
            self.scripts.pop_front()
        } else {
            self.scripts.front().cloned()
        };
        self.current = next.unwrap_or_default().chars().collect();
        self.position = 0;
    }

    fn next_token_logits(&mut self, _context: &[TokenId]) -> Result<Vec<f32>, ModelError> {
        if self.panic {
            panic!("scripted model panic");
        }
        if self.fail {
            return Err(ModelError::Inference("scripted failure".to_string()));
        }
        let mut logits = vec![0.0; self.vocab_size()];
        let next = self.current.get(self.position).copied().unwrap_or('\n');
        self.position += 1;
        logits[Self::char_to_token(next) as usize] = SCRIPT_LOGIT;
        Ok(logits)
    }
}

/// Returns queued scores, then a fixed fallback
#[derive(Debug, Clone)]
pub struct ScriptedScorer {
    scores: VecDeque<f32>,
    fallback: f32,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedScorer {
    pub fn new(scores: impl IntoIterator<Item = f32>) -> Self {
        Self {
            scores: scores.into_iter().collect(),
            fallback: 1.0,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: f32) -> Self {
        self.fallback = fallback;
        self
    }

    /// Premise / hypothesis pairs scored so far
    #[must_use]
    pub fn calls(&self) -> Arc<Mutex<Vec<(String, String)>>> {
        Arc::clone(&self.calls)
    }
}

impl EntailmentScorer for ScriptedScorer {
    fn score(&mut self, premise: &str, hypothesis: &str) -> Result<f32, ModelError> {
        self.calls.lock().push((premise.to_string(), hypothesis.to_string()));
        Ok(self.scores.pop_front().unwrap_or(self.fallback))
    }
}

/// Summarizer that always answers with the same text
#[derive(Debug, Clone)]
pub struct FixedSummarizer(pub String);

impl Summarizer for FixedSummarizer {
    fn summarize(&mut self, _text: &str) -> Result<String, ModelError> {
        Ok(self.0.clone())
    }
}

type Reply = Box<dyn Fn(&GenerationRequest) -> Result<Vec<String>, GenerationError> + Send + Sync>;

/// Backend double that counts calls and can be held at a gate
///
/// By default every request yields one line, `"line for <key>"`.
pub struct CountingBackend {
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
    reply: Reply,
    gate: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for CountingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingBackend")
            .field("calls", &self.calls)
            .field("gated", &self.gate.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for CountingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            reply: Box::new(|request| Ok(vec![format!("line for {}", request.key)])),
            gate: None,
        }
    }

    /// Answer every request with the given closure
    #[must_use]
    pub fn replying<F>(mut self, reply: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<Vec<String>, GenerationError> + Send + Sync + 'static,
    {
        self.reply = Box::new(reply);
        self
    }

    /// Hold every call until [`CountingBackend::release`] hands out a permit
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` held calls through
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Keys requested, in dispatch order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.key.clone()).collect()
    }
}

#[async_trait]
impl GenerationBackend for CountingBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| GenerationError::WorkerUnavailable)?;
            permit.forget();
        }

        let lines = (self.reply)(&request)?;
        Ok(GenerationOutcome {
            lines,
            model: "counting".to_string(),
        })
    }
}
