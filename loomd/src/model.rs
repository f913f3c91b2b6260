//! Language model served by a child process
//!
//! The daemon does not link an inference runtime. It starts a model command
//! and talks to it over newline-delimited JSON on stdin/stdout, one request
//! per line and one reply per line:
//!
//! | request | reply |
//! |---------|-------|
//! | `{"op":"info"}` | `{"name":..,"vocab_size":..,"max_context":..}` |
//! | `{"op":"tokenize","text":..}` | `{"tokens":[..]}` |
//! | `{"op":"detokenize","tokens":[..]}` | `{"text":..}` |
//! | `{"op":"start","prompt":[..]}` | `{}` |
//! | `{"op":"logits","context":[..]}` | `{"logits":[..]}` |
//! | `{"op":"entail","premise":..,"hypothesis":..}` | `{"score":..}` |
//! | `{"op":"summarize","text":..}` | `{"summary":..}` |
//!
//! Any reply may instead be `{"error":"..."}`. Every call is blocking; the
//! generation worker thread is the only caller. A failed `tokenize`,
//! `detokenize` or `start` is kept and reported through
//! [`LanguageModel::take_failure`], failing the job it happened in.

use loom_decode::{EntailmentScorer, LanguageModel, ModelError, Summarizer, TokenId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

/// Failures talking to the model process
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Command could not be started
    #[error("cannot start model command {command:?}: {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying failure
        source: std::io::Error,
    },

    /// Pipe failure
    #[error("model process i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Process closed its stdout
    #[error("model process exited")]
    Exited,

    /// Reply was not the expected JSON
    #[error("bad reply from model process: {0}")]
    Protocol(String),

    /// Process reported an error
    #[error("model process error: {0}")]
    Remote(String),
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Info,
    Tokenize { text: &'a str },
    Detokenize { tokens: &'a [TokenId] },
    Start { prompt: &'a [TokenId] },
    Logits { context: &'a [TokenId] },
    Entail { premise: &'a str, hypothesis: &'a str },
    Summarize { text: &'a str },
}

#[derive(Debug, Deserialize)]
struct Info {
    name: String,
    vocab_size: usize,
    max_context: usize,
}

#[derive(Debug, Deserialize)]
struct Tokens {
    tokens: Vec<TokenId>,
}

#[derive(Debug, Deserialize)]
struct Text {
    text: String,
}

#[derive(Debug, Deserialize)]
struct Logits {
    logits: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct Score {
    score: f32,
}

#[derive(Debug, Deserialize)]
struct Summary {
    summary: String,
}

#[derive(Debug, Deserialize)]
struct Ack {}

/// Pipes to one running model process
#[derive(Debug)]
pub struct ModelProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl ModelProcess {
    /// Start `command` through the shell
    ///
    /// # Errors
    /// Returns `ProcessError::Spawn` if the command cannot be started.
    pub fn spawn(command: &str) -> Result<Self, ProcessError> {
        let spawn_error = |source| ProcessError::Spawn {
            command: command.to_string(),
            source,
        };
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child.stdin.take().ok_or(ProcessError::Exited)?;
        let stdout = child.stdout.take().ok_or(ProcessError::Exited)?;
        tracing::info!("Started model process {} ({})", child.id(), command);

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line: String::new(),
        })
    }

    fn call<T: DeserializeOwned>(&mut self, request: &Request<'_>) -> Result<T, ProcessError> {
        let mut payload = serde_json::to_vec(request).map_err(|e| ProcessError::Protocol(e.to_string()))?;
        payload.push(b'\n');
        self.stdin.write_all(&payload)?;
        self.stdin.flush()?;

        self.line.clear();
        if self.stdout.read_line(&mut self.line)? == 0 {
            return Err(ProcessError::Exited);
        }

        let reply: serde_json::Value =
            serde_json::from_str(&self.line).map_err(|e| ProcessError::Protocol(e.to_string()))?;
        if let Some(message) = reply.get("error") {
            let message = message.as_str().map_or_else(|| message.to_string(), str::to_string);
            return Err(ProcessError::Remote(message));
        }
        serde_json::from_value(reply).map_err(|e| ProcessError::Protocol(e.to_string()))
    }
}

impl Drop for ModelProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!("Model process already gone: {}", e);
        }
        let _ = self.child.wait();
    }
}

type Shared = Arc<Mutex<ModelProcess>>;

/// [`LanguageModel`] backed by a [`ModelProcess`]
#[derive(Debug)]
pub struct ProcessModel {
    process: Shared,
    name: String,
    vocab_size: usize,
    max_context: usize,
    /// First failure of an infallible call, until the worker collects it
    failure: Mutex<Option<ModelError>>,
}

impl ProcessModel {
    /// Start the model command and ask it to describe itself
    ///
    /// # Errors
    /// Any [`ProcessError`] from starting the process or the `info` call.
    pub fn spawn(command: &str) -> Result<Self, ProcessError> {
        let mut process = ModelProcess::spawn(command)?;
        let info: Info = process.call(&Request::Info)?;
        tracing::info!(
            "Model {} has {} tokens and a context of {}",
            info.name,
            info.vocab_size,
            info.max_context
        );
        Ok(Self {
            process: Arc::new(Mutex::new(process)),
            name: info.name,
            vocab_size: info.vocab_size,
            max_context: info.max_context,
            failure: Mutex::new(None),
        })
    }

    fn record_failure(&self, what: &str, error: &ProcessError) {
        tracing::error!("{} failed: {}", what, error);
        self.failure
            .lock()
            .get_or_insert_with(|| ModelError::Inference(format!("{what}: {error}")));
    }

    /// Entailment scorer served by the same process
    #[must_use]
    pub fn scorer(&self) -> ProcessScorer {
        ProcessScorer(Arc::clone(&self.process))
    }

    /// Summarizer served by the same process
    #[must_use]
    pub fn summarizer(&self) -> ProcessSummarizer {
        ProcessSummarizer(Arc::clone(&self.process))
    }
}

impl LanguageModel for ProcessModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        match self.process.lock().call::<Tokens>(&Request::Tokenize { text }) {
            Ok(reply) => reply.tokens,
            Err(e) => {
                self.record_failure("tokenize", &e);
                Vec::new()
            }
        }
    }

    fn detokenize(&self, tokens: &[TokenId]) -> String {
        match self.process.lock().call::<Text>(&Request::Detokenize { tokens }) {
            Ok(reply) => reply.text,
            Err(e) => {
                self.record_failure("detokenize", &e);
                String::new()
            }
        }
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_context(&self) -> usize {
        self.max_context
    }

    fn start_sequence(&mut self, prompt: &[TokenId]) {
        let reply = self.process.lock().call::<Ack>(&Request::Start { prompt });
        if let Err(e) = reply {
            self.record_failure("start", &e);
        }
    }

    fn next_token_logits(&mut self, context: &[TokenId]) -> Result<Vec<f32>, ModelError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let reply: Logits = self
            .process
            .lock()
            .call(&Request::Logits { context })
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        if reply.logits.len() == self.vocab_size {
            Ok(reply.logits)
        } else {
            Err(ModelError::Inference(format!(
                "expected {} logits, got {}",
                self.vocab_size,
                reply.logits.len()
            )))
        }
    }

    fn take_failure(&mut self) -> Option<ModelError> {
        self.failure.get_mut().take()
    }
}

/// [`EntailmentScorer`] sharing the model process
#[derive(Debug)]
pub struct ProcessScorer(Shared);

impl EntailmentScorer for ProcessScorer {
    fn score(&mut self, premise: &str, hypothesis: &str) -> Result<f32, ModelError> {
        let reply: Score = self
            .0
            .lock()
            .call(&Request::Entail { premise, hypothesis })
            .map_err(|e| ModelError::Scoring(e.to_string()))?;
        Ok(reply.score.clamp(0.0, 1.0))
    }
}

/// [`Summarizer`] sharing the model process
#[derive(Debug)]
pub struct ProcessSummarizer(Shared);

impl Summarizer for ProcessSummarizer {
    fn summarize(&mut self, text: &str) -> Result<String, ModelError> {
        let reply: Summary = self
            .0
            .lock()
            .call(&Request::Summarize { text })
            .map_err(|e| ModelError::Summarization(e.to_string()))?;
        Ok(reply.summary)
    }
}
