//! Worker isolation
//!
//! The model lives on its own OS thread and is reached only through a
//! bounded channel:
//! - [`WorkerHandle::spawn`] loads the model on that thread and waits for it
//! - [`GenerationBackend::generate`] sends one request and awaits the reply
//! - a panic inside generation is caught and reported as an error; the
//!   thread keeps serving

use crate::error::GenerationError;
use crate::model::LanguageModel;
use crate::types::{GenerationOutcome, GenerationRequest};
use crate::worker::GenerationWorker;
use async_trait::async_trait;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

/// Anything that can turn a request into lines
///
/// The scheduler depends on this seam only; tests plug in scripted backends.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate lines for one request
    ///
    /// # Errors
    /// Returns a `GenerationError` when the backend fails.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError>;
}

/// Messages sent to the worker thread
#[derive(Debug)]
pub enum WorkerMessage {
    /// Generate lines and reply on the channel
    Generate {
        /// Job to run
        request: GenerationRequest,
        /// Reply channel
        reply: oneshot::Sender<Result<GenerationOutcome, GenerationError>>,
    },
    /// Stop the thread after the current job
    Shutdown,
}

/// Handle for communicating with the worker thread
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<WorkerMessage>,
    model_name: String,
}

impl WorkerHandle {
    /// Start a worker thread
    ///
    /// `load` runs on the new thread, so heavyweight model state never has
    /// to cross threads.
    ///
    /// # Errors
    /// - `GenerationError::LoadFailed` if `load` fails or panics
    pub async fn spawn<M, F>(load: F) -> Result<(Self, JoinHandle<()>), GenerationError>
    where
        M: LanguageModel + 'static,
        F: FnOnce() -> Result<GenerationWorker<M>, GenerationError> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("loom-generator".to_string())
            .spawn(move || worker_thread(load, receiver, ready_tx))
            .map_err(|e| GenerationError::LoadFailed(e.to_string()))?;

        let model_name = ready_rx
            .await
            .map_err(|_| GenerationError::LoadFailed("worker thread died during load".to_string()))??;
        tracing::info!("Generation worker ready with model {}", model_name);

        Ok((Self { sender, model_name }, thread))
    }

    /// Name of the loaded model
    #[inline]
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Ask the worker thread to stop
    pub async fn shutdown(&self) {
        let _ = self.sender.send(WorkerMessage::Shutdown).await;
    }
}

#[async_trait]
impl GenerationBackend for WorkerHandle {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Generate { request, reply })
            .await
            .map_err(|_| GenerationError::WorkerUnavailable)?;
        response.await.map_err(|_| GenerationError::WorkerUnavailable)?
    }
}

fn worker_thread<M, F>(
    load: F,
    mut receiver: mpsc::Receiver<WorkerMessage>,
    ready: oneshot::Sender<Result<String, GenerationError>>,
) where
    M: LanguageModel,
    F: FnOnce() -> Result<GenerationWorker<M>, GenerationError>,
{
    let _span = tracing::info_span!("worker").entered();
    let loaded = panic::catch_unwind(AssertUnwindSafe(load))
        .unwrap_or_else(|payload| Err(GenerationError::LoadFailed(panic_message(payload.as_ref()))));

    let mut worker = match loaded {
        Ok(worker) => {
            let _ = ready.send(Ok(worker.model_name().to_string()));
            worker
        }
        Err(e) => {
            tracing::error!("Generation worker failed to load: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Some(message) = receiver.blocking_recv() {
        match message {
            WorkerMessage::Generate { request, reply } => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| worker.generate_lines(&request)))
                    .unwrap_or_else(|payload| Err(GenerationError::Panicked(panic_message(payload.as_ref()))));
                if let Err(e) = &result {
                    tracing::error!("Generation failed for {}: {}", request.key, e);
                }
                let _ = reply.send(result);
            }
            WorkerMessage::Shutdown => break,
        }
    }

    tracing::info!("Generation worker stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
