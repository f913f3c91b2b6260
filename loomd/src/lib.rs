//! Loom daemon
//!
//! Wires the pieces of a running server together:
//! - [`cli`]: flags and the TOML configuration file
//! - [`model`]: the language model as a child process
//! - [`translate`]: optional translation command
//! - [`auth`]: shared-secret request tokens
//! - [`server`]: JSON-lines transport over TCP or the console

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod auth;
pub mod cli;
pub mod model;
pub mod server;
pub mod translate;

use anyhow::{Context, Result};
use cli::Cli;
use loom_core::{Loom, SqliteStore};
use loom_decode::{GenerationError, GenerationWorker, WorkerHandle};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber; `RUST_LOG` wins over `level`
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the daemon until `killme` or Ctrl-C
///
/// # Errors
/// Fails if the configuration, the store, the model or the listener cannot
/// be set up.
pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    tracing::info!("Loom daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let store = SqliteStore::open(&config.store.database)
        .with_context(|| format!("cannot open database {}", config.store.database.display()))?;
    tracing::info!("Database: {}", config.store.database.display());

    let command = cli.model_command.clone();
    let generation = config.generation.clone();
    let (nli, summarize) = (cli.nli, cli.summarize);
    let (worker, worker_thread) = WorkerHandle::spawn(move || {
        let model = model::ProcessModel::spawn(&command).map_err(|e| GenerationError::LoadFailed(e.to_string()))?;
        let scorer = model.scorer();
        let summarizer = model.summarizer();
        let mut worker = GenerationWorker::new(model, generation);
        if nli {
            worker = worker.with_scorer(Box::new(scorer));
        }
        if summarize {
            worker = worker.with_summarizer(Box::new(summarizer));
        }
        Ok(worker)
    })
    .await
    .context("generation worker did not start")?;

    let mut loom = Loom::new(Arc::new(store), Arc::new(worker.clone()), config.clone());
    if let Some(command) = &cli.translate_command {
        loom = loom.with_translator(Arc::new(translate::CommandTranslator::new(command.clone())));
    }
    let dispatch = loom.start();

    let ctrl_c = {
        let loom = loom.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                loom.shutdown();
            }
        })
    };

    let server = server::Server::new(loom.clone(), auth::Auth::new(&config.server));
    let served = if cli.console {
        tracing::info!("Console mode, reading requests from stdin");
        server
            .serve_lines(tokio::io::BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    } else {
        let address = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("cannot listen on {address}"))?;
        server.serve_tcp(listener).await
    };

    loom.shutdown();
    ctrl_c.abort();
    let _ = dispatch.await;
    worker.shutdown().await;
    if worker_thread.join().is_err() {
        tracing::error!("Generation worker thread panicked");
    }
    tracing::info!("Loom daemon stopped");
    served.context("transport failed")
}
