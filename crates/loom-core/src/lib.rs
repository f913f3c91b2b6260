//! Loom Core: store, scheduler and command surface
//!
//! Serves a branching tree of dialogue lines to many clients at once:
//! - [`store`]: scenes, lines and the access log in SQLite
//! - [`scheduler`]: two-queue dispatch to a single generation backend, with
//!   per-key deduplication
//! - [`resolve`]: replays a key's edit operations into the lines of a branch
//! - [`commands`] / [`loom`]: the JSON verbs clients speak
//!
//! # Example
//!
//! ```rust,no_run
//! use loom_core::{Loom, LoomConfig, SqliteStore};
//! use loom_decode::GenerationBackend;
//! use std::sync::Arc;
//!
//! async fn serve(backend: Arc<dyn GenerationBackend>) -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteStore::open("database.db")?);
//!     let loom = Loom::new(store, backend, LoomConfig::new());
//!     let _dispatch = loom.start();
//!
//!     let reply = loom.handle(&serde_json::json!({"key": "demo-a"})).await;
//!     println!("{}", loom_core::render(reply));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod commands;
pub mod config;
pub mod error;
pub mod loom;
pub mod prompt;
pub mod resolve;
pub mod scheduler;
pub mod store;
pub mod translate;
pub mod types;

pub use commands::{render, Command};
pub use config::{LoomConfig, SchedulerConfig, ServerConfig, StoreConfig};
pub use error::{LoomError, LoomResult, StoreError};
pub use loom::Loom;
pub use scheduler::{Job, Priority, Scheduler, SchedulerStats};
pub use store::{SqliteStore, Store};
pub use translate::Translator;
pub use types::{AccessEntry, InputType, Line, NewScene, Scene, SceneView, SearchField, SearchResults};

/// Server version recorded with every stored line
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
