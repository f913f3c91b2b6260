//! Generation scheduler
//!
//! Serializes access to the generation backend:
//! - two queues: foreground (FIFO) for clients waiting on a line, background
//!   (LIFO) for speculative pregeneration
//! - one in-flight entry per key, so concurrent requests share one job
//! - one dispatch loop that rechecks the store, generates, persists and wakes
//!   every waiter exactly once, then writes the job's follow-up lines
//!
//! Waiters block on a per-key `watch` channel. Dropping its sender without a
//! result (shutdown) releases them with [`LoomError::ShuttingDown`].
//!
//! Store calls are synchronous SQLite work and run on the blocking pool
//! through [`Scheduler::with_store`].

use crate::config::SchedulerConfig;
use crate::error::{LoomError, LoomResult, StoreError};
use crate::prompt::next_line_request;
use crate::store::Store;
use crate::translate::Translator;
use crate::types::{Line, Scene};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use loom_decode::{GenerationBackend, GenerationError, GenerationOutcome, GenerationRequest};
use loom_keys::compress_display;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Outcome delivered to the waiters of one key
type JobResult = Result<Line, String>;

/// Queue a job is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// A client is waiting
    Foreground,
    /// Speculative look-ahead
    Background,
}

/// Lines written after the requested one, along the `a` branch
#[derive(Debug, Clone)]
struct FollowUp {
    scene: Scene,
    /// Lines before the requested key
    lines: Vec<String>,
    remaining: usize,
}

/// One queued generation
#[derive(Debug, Clone)]
pub struct Job {
    /// What the backend receives
    pub request: GenerationRequest,
    /// Forced speaker prefix added to the first stored line
    pub prepend: String,
    follow_up: Option<FollowUp>,
}

impl Job {
    /// Create a job
    #[inline]
    #[must_use]
    pub fn new(request: GenerationRequest, prepend: impl Into<String>) -> Self {
        Self {
            request,
            prepend: prepend.into(),
            follow_up: None,
        }
    }

    /// Builder: after the requested line, write `count` more along the `a`
    /// branch of `scene`, where `lines` are the lines before the requested key
    #[must_use]
    pub fn with_follow_ups(mut self, scene: Scene, lines: Vec<String>, count: usize) -> Self {
        self.follow_up = (count > 0).then_some(FollowUp {
            scene,
            lines,
            remaining: count,
        });
        self
    }

    #[inline]
    fn key(&self) -> &str {
        &self.request.key
    }
}

#[derive(Debug, Default)]
struct Queues {
    foreground: VecDeque<Job>,
    /// Most recent request served first
    background: Vec<Job>,
}

impl Queues {
    fn pop(&mut self) -> Option<(Job, Priority)> {
        if let Some(job) = self.foreground.pop_front() {
            return Some((job, Priority::Foreground));
        }
        self.background.pop().map(|job| (job, Priority::Background))
    }

    fn push(&mut self, job: Job, priority: Priority) {
        match priority {
            Priority::Foreground => self.foreground.push_back(job),
            Priority::Background => self.background.push(job),
        }
    }

    fn promote(&mut self, key: &str) {
        if let Some(idx) = self.background.iter().position(|j| j.key() == key) {
            let job = self.background.remove(idx);
            self.foreground.push_back(job);
        }
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Backend calls made
    pub generated: usize,
    /// Requests that joined an existing job
    pub deduplicated: usize,
    /// Jobs that failed
    pub failed: usize,
    /// Jobs waiting in the foreground queue
    pub foreground_len: usize,
    /// Jobs waiting in the background queue
    pub background_len: usize,
}

struct Inner {
    store: Arc<dyn Store>,
    backend: Arc<dyn GenerationBackend>,
    translator: Option<Arc<dyn Translator>>,
    config: SchedulerConfig,
    queues: Mutex<Queues>,
    wakeup: Notify,
    in_flight: DashMap<String, watch::Sender<Option<JobResult>>>,
    /// Flipped under the queue lock
    running: AtomicBool,
    generated: AtomicUsize,
    deduplicated: AtomicUsize,
    failed: AtomicUsize,
}

/// Shared handle to the scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler; call [`Scheduler::spawn`] to start dispatching
    #[must_use]
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn GenerationBackend>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                backend,
                translator: None,
                config,
                queues: Mutex::new(Queues::default()),
                wakeup: Notify::new(),
                in_flight: DashMap::new(),
                running: AtomicBool::new(true),
                generated: AtomicUsize::new(0),
                deduplicated: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            }),
        }
    }

    /// Builder: translate lines as they are stored and read
    ///
    /// Must be called before the scheduler is cloned or spawned.
    #[must_use]
    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.translator = Some(translator),
            None => tracing::warn!("Translator ignored, scheduler already shared"),
        }
        self
    }

    /// Run a store call on the blocking pool
    ///
    /// # Errors
    /// The call's own `StoreError`, or `StoreError::Task` if it panicked.
    pub async fn with_store<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Optional translator
    #[inline]
    #[must_use]
    pub fn translator(&self) -> Option<&Arc<dyn Translator>> {
        self.inner.translator.as_ref()
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Is the dispatch loop still accepting work?
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let queues = self.inner.queues.lock();
        SchedulerStats {
            generated: self.inner.generated.load(Ordering::Relaxed),
            deduplicated: self.inner.deduplicated.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            foreground_len: queues.foreground.len(),
            background_len: queues.background.len(),
        }
    }

    /// Start the dispatch loop on the current runtime
    #[must_use]
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(
            async move { scheduler.run().await }.instrument(tracing::info_span!("dispatch")),
        )
    }

    /// Get the line for `job`'s key, generating it if needed
    ///
    /// A request for a key that is already queued or generating joins that
    /// job instead of creating a new one. A foreground request for a key
    /// waiting in the background queue moves it to the foreground.
    ///
    /// # Errors
    /// - `LoomError::GenerationFailed` if the job failed
    /// - `LoomError::ShuttingDown` if the scheduler stopped first
    pub async fn request_generation(&self, job: Job, priority: Priority) -> LoomResult<Line> {
        if !self.is_running() {
            return Err(LoomError::ShuttingDown);
        }

        let key = job.key().to_string();
        let (mut receiver, queued) = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().subscribe(), None),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                entry.insert(sender);
                (receiver, Some(job))
            }
        };

        if let Some(job) = queued {
            let mut queues = self.inner.queues.lock();
            // shutdown drains the queues under this lock
            if !self.is_running() {
                drop(queues);
                self.inner.in_flight.remove(&key);
                return Err(LoomError::ShuttingDown);
            }
            queues.push(job, priority);
            tracing::info!(
                "Queued {:?} generation of {} ({} foreground, {} background)",
                priority,
                compress_display(&key),
                queues.foreground.len(),
                queues.background.len()
            );
            drop(queues);
            self.inner.wakeup.notify_one();
        } else {
            self.inner.deduplicated.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Joining in-flight generation of {}", compress_display(&key));
            if priority == Priority::Foreground {
                self.inner.queues.lock().promote(&key);
            }
        }

        let result = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| LoomError::ShuttingDown)?
            .clone();

        match result {
            Some(Ok(line)) => Ok(line),
            Some(Err(message)) => Err(LoomError::GenerationFailed(message)),
            None => Err(LoomError::ShuttingDown),
        }
    }

    /// Stop dispatching and release every waiter
    pub fn shutdown(&self) {
        {
            let mut queues = self.inner.queues.lock();
            if !self.inner.running.swap(false, Ordering::SeqCst) {
                return;
            }
            queues.foreground.clear();
            queues.background.clear();
        }
        tracing::info!("Scheduler shutting down");
        self.inner.in_flight.clear();
        self.inner.wakeup.notify_one();
    }

    async fn run(self) {
        tracing::info!("Dispatch loop started");
        while self.is_running() {
            let next = self.inner.queues.lock().pop();
            match next {
                Some((job, priority)) => self.dispatch(job, priority).await,
                None => {
                    tokio::select! {
                        () = self.inner.wakeup.notified() => {}
                        () = tokio::time::sleep(self.inner.config.poll_interval()) => {}
                    }
                }
            }
        }
        tracing::info!("Dispatch loop stopped");
    }

    async fn dispatch(&self, job: Job, priority: Priority) {
        let key = job.key().to_string();
        let display_key = compress_display(&key);
        let Job {
            request,
            prepend,
            follow_up,
        } = job;

        let stored_key = key.clone();
        let mut written: Vec<Line> = Vec::new();
        let result = match self.with_store(move |store| store.line(&stored_key)).await {
            Ok(Some(line)) => {
                tracing::info!("Not generating {}, already stored", display_key);
                Ok(line)
            }
            Ok(None) => {
                tracing::info!("Generating {} ({:?})", display_key, priority);
                self.generate(request, &prepend).await.and_then(|lines| {
                    let first = lines.first().cloned().ok_or_else(|| format!("no line stored at {key}"));
                    written = lines;
                    first
                })
            }
            Err(e) => Err(e.to_string()),
        };

        if let Err(message) = &result {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Failed to generate {}: {}", display_key, message);
        }
        self.publish(&key, result);
        for line in written.iter().skip(1) {
            self.publish(&line.key, Ok(line.clone()));
        }

        if let Some(mut follow_up) = follow_up {
            follow_up.lines.extend(written.iter().map(|l| l.text.clone()));
            if let Some(last) = written.last() {
                self.follow_up(follow_up, format!("{}a", last.key)).await;
            }
        }
    }

    /// Write the lines after a finished job, one backend call each
    ///
    /// Every call gets its own repetition window and forced speaker. Stops at
    /// the end of the scene, at a failure or on shutdown.
    async fn follow_up(&self, mut follow_up: FollowUp, mut key: String) {
        while follow_up.remaining > 0 && self.is_running() {
            follow_up.remaining -= 1;

            let lookup = key.clone();
            let written = match self.with_store(move |store| store.line(&lookup)).await {
                Ok(Some(line)) => vec![line],
                Ok(None) => {
                    let Some((request, prepend)) = next_line_request(
                        &follow_up.scene,
                        &follow_up.lines,
                        key.clone(),
                        Vec::new(),
                        &self.inner.config,
                    ) else {
                        tracing::debug!("Scene ended, no line after {}", compress_display(&key));
                        return;
                    };
                    tracing::info!("Generating follow-up {}", compress_display(&key));
                    match self.generate(request, &prepend).await {
                        Ok(lines) => lines,
                        Err(message) => {
                            tracing::warn!("Follow-up {} failed: {}", compress_display(&key), message);
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Cannot read {}: {}", compress_display(&key), e);
                    return;
                }
            };

            for line in &written {
                self.publish(&line.key, Ok(line.clone()));
            }
            follow_up.lines.extend(written.iter().map(|l| l.text.clone()));
            match written.last() {
                Some(last) => key = format!("{}a", last.key),
                None => return,
            }
        }
    }

    /// Wake the waiters of `key`, if any
    fn publish(&self, key: &str, result: JobResult) {
        if let Some((_, sender)) = self.inner.in_flight.remove(key) {
            sender.send_replace(Some(result));
        }
    }

    /// Call the backend, retrying failures that may not happen again
    async fn call_backend(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError> {
        let retries = self.inner.config.generation_retries;
        let mut attempt = 0;
        loop {
            self.inner.generated.fetch_add(1, Ordering::Relaxed);
            match self.inner.backend.generate(request.clone()).await {
                Err(e) if e.is_retryable() && attempt < retries && self.is_running() => {
                    attempt += 1;
                    tracing::warn!(
                        "Generating {} failed, retry {}/{}: {}",
                        compress_display(&request.key),
                        attempt,
                        retries,
                        e
                    );
                }
                outcome => return outcome,
            }
        }
    }

    /// Generate and persist the lines for one request
    ///
    /// Returns the lines as stored, which for a key written meanwhile is the
    /// earlier text.
    async fn generate(&self, request: GenerationRequest, prepend: &str) -> Result<Vec<Line>, String> {
        let key = request.key.clone();
        let outcome = self.call_backend(request).await.map_err(|e| e.to_string())?;

        let mut texts = outcome.lines;
        if let Some(first) = texts.first_mut() {
            first.insert_str(0, prepend);
        }
        tracing::info!("Storing {} lines starting at {}", texts.len(), compress_display(&key));

        let mut stored = Vec::with_capacity(texts.len());
        let mut line_key = key;
        for text in texts {
            let mut line = Line::new(line_key.clone(), text, outcome.model.clone());
            if let Some(translator) = &self.inner.translator {
                match translator.translate(&line.text).await {
                    Ok(translated) => line.translated_text = Some(translated),
                    Err(e) => tracing::warn!("Translation of {} failed: {}", compress_display(&line_key), e),
                }
            }
            stored.push(self.persist(line).await.map_err(|e| e.to_string())?);
            line_key.push('a');
        }
        Ok(stored)
    }

    /// Insert `line` unless its key is taken; returns what is stored there
    async fn persist(&self, line: Line) -> Result<Line, StoreError> {
        self.with_store(move |store| {
            if !store.insert_line(&line)? {
                tracing::debug!("Line {} already stored, keeping it", compress_display(&line.key));
            }
            Ok(store.line(&line.key)?.unwrap_or(line))
        })
        .await
    }

    /// Store `line` without generating, waking any waiters
    ///
    /// # Errors
    /// Returns `LoomError::Store` if the write fails.
    pub async fn store_direct(&self, line: Line) -> LoomResult<Line> {
        let stored = self.persist(line).await?;
        self.publish(&stored.key, Ok(stored.clone()));
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(key: &str) -> Job {
        Job::new(GenerationRequest::new(key, "p"), "")
    }

    #[test]
    fn foreground_before_background() {
        let mut queues = Queues::default();
        queues.background.push(job("s-a"));
        queues.background.push(job("s-b"));
        queues.foreground.push_back(job("s-c"));
        queues.foreground.push_back(job("s-d"));

        let order: Vec<String> = std::iter::from_fn(|| queues.pop())
            .map(|(job, _)| job.request.key)
            .collect();
        assert_eq!(order, vec!["s-c", "s-d", "s-b", "s-a"]);
    }

    #[test]
    fn follow_ups_need_a_count() {
        let scene = Scene {
            key: "s".to_string(),
            prompt: "A room.".to_string(),
            outline: None,
            char1: None,
            char2: None,
            username: String::new(),
            timestamp: String::new(),
            translated_prompt: None,
            translated_outline: None,
        };
        assert!(job("s-a").with_follow_ups(scene.clone(), Vec::new(), 0).follow_up.is_none());
        let job = job("s-a").with_follow_ups(scene, vec!["Hi.".to_string()], 2);
        assert_eq!(job.follow_up.map(|f| (f.lines, f.remaining)), Some((vec!["Hi.".to_string()], 2)));
    }

    #[test]
    fn promote_moves_background_job() {
        let mut queues = Queues::default();
        queues.background.push(job("s-a"));
        queues.background.push(job("s-b"));
        queues.promote("s-a");

        assert_eq!(queues.foreground.len(), 1);
        assert_eq!(queues.pop().map(|(j, p)| (j.request.key, p)), Some(("s-a".to_string(), Priority::Foreground)));
    }
}
