//! The loom server core
//!
//! [`Loom`] ties the store, the scheduler and the command surface together.
//! Transports hand it parsed JSON and render whatever comes back.

use crate::commands::{Command, HumanInputArgs, ListScenesArgs, RatingArgs, RecentArgs, SceneArgs, SearchArgs};
use crate::config::LoomConfig;
use crate::error::{LoomError, LoomResult};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::store::Store;
use crate::translate::Translator;
use crate::types::{AccessEntry, NewScene, SceneView, SearchResults};
use loom_decode::GenerationBackend;
use loom_keys::{compress_display, normalize_scene_id, BranchKey};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Server core
#[derive(Debug, Clone)]
pub struct Loom {
    scheduler: Scheduler,
    config: Arc<LoomConfig>,
    stop: Arc<watch::Sender<bool>>,
}

impl Loom {
    /// Create a server core over a store and a generation backend
    #[must_use]
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn GenerationBackend>, config: LoomConfig) -> Self {
        let scheduler = Scheduler::new(store, backend, config.scheduler.clone());
        let (stop, _) = watch::channel(false);
        Self {
            scheduler,
            config: Arc::new(config),
            stop: Arc::new(stop),
        }
    }

    /// Builder: translate prompts and lines
    #[must_use]
    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.scheduler = self.scheduler.with_translator(translator);
        self
    }

    /// Start the dispatch loop
    #[must_use]
    pub fn start(&self) -> JoinHandle<()> {
        self.scheduler.spawn()
    }

    /// Scheduler behind this core
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    /// Scheduler counters
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Receiver that flips to `true` once the server should stop
    #[must_use]
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Stop the scheduler and tell transports to close
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.stop.send_replace(true);
    }

    /// Parse and run one request
    ///
    /// # Errors
    /// Any [`LoomError`]; see the individual commands.
    pub async fn handle(&self, data: &Value) -> LoomResult<Value> {
        let command = Command::parse(data)?;
        tracing::debug!("Handling {}", command.verb());
        self.execute(command).await
    }

    /// Run a parsed command
    ///
    /// # Errors
    /// Any [`LoomError`]; see the individual commands.
    pub async fn execute(&self, command: Command) -> LoomResult<Value> {
        match command {
            Command::Ping => Ok(json!("ping")),
            Command::Kill => {
                tracing::info!("Shutdown requested");
                self.shutdown();
                Ok(json!("bye"))
            }
            Command::Scene(args) => {
                let key = self.create_scene(args).await?;
                Ok(json!({ "key": key }))
            }
            Command::HumanInput(args) => {
                let key = self.human_input(args).await?;
                Ok(json!({ "key": key }))
            }
            Command::Rating(args) => Ok(serde_json::to_value(self.rate(args).await?)?),
            Command::Key(args) => Ok(serde_json::to_value(self.resolve(&args.key, &args.username).await?)?),
            Command::Search(args) => self.search(args).await,
            Command::Pregenerate(key) => {
                self.pregenerate(key);
                Ok(json!(""))
            }
            Command::Recent(args) => self.recent(args).await,
            Command::ListScenes(args) => self.list_scenes(args).await,
        }
    }

    /// Store a new scene; returns its id, suffixed if the name was taken
    ///
    /// # Errors
    /// - `LoomError::InvalidKey` if the name normalizes to nothing
    /// - `LoomError::TooManyCollisions` if every suffix is taken
    pub async fn create_scene(&self, args: SceneArgs) -> LoomResult<String> {
        let key = normalize_scene_id(&args.key)?;
        tracing::info!("Storing scene {}", key);
        let scene = NewScene {
            key: key.clone(),
            prompt: args.scene.replace("\r\n", "\n").trim().to_string(),
            outline: args.outline.map(|o| o.replace("\r\n", "\n").trim().to_string()),
            char1: args.char1.filter(|c| !c.is_empty()),
            char2: args.char2.filter(|c| !c.is_empty()),
            username: args.username,
        };
        let max_suffix = self.config.scheduler.max_scene_suffix;
        self.scheduler
            .with_store(move |store| store.insert_scene(&scene, max_suffix))
            .await?
            .ok_or(LoomError::TooManyCollisions(key))
    }

    /// Store a human line under the next free uppercase letter
    ///
    /// # Errors
    /// - `LoomError::TooManyHumanInputs` if `A` to `Z` are taken
    pub async fn human_input(&self, args: HumanInputArgs) -> LoomResult<String> {
        let text = args.input_type.format(&args.text);
        tracing::info!(
            "Storing {} input at {}: {:?}",
            args.input_type.as_str(),
            compress_display(&args.key),
            text
        );
        let (parent, input_type) = (args.key.clone(), args.input_type.as_str());
        self.scheduler
            .with_store(move |store| store.insert_human_line(&parent, &text, input_type))
            .await?
            .ok_or(LoomError::TooManyHumanInputs(args.key))
    }

    /// Upsert a rating
    ///
    /// # Errors
    /// Returns `LoomError::Store` on storage failure.
    pub async fn rate(&self, args: RatingArgs) -> LoomResult<AccessEntry> {
        Ok(self
            .scheduler
            .with_store(move |store| store.rate(&args.key, &args.username, args.rating))
            .await?)
    }

    /// Resolve a branch for a user
    ///
    /// # Errors
    /// See [`Scheduler::resolve`].
    pub async fn resolve(&self, key: &BranchKey, username: &str) -> LoomResult<SceneView> {
        self.scheduler.resolve(key, username, false).await
    }

    /// Resolve a branch in the background; failures are only logged
    pub fn pregenerate(&self, key: BranchKey) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.resolve(&key, "", true).await {
                tracing::warn!("Pregenerating {} failed: {}", key.display(), e);
            }
        })
    }

    /// Search prompts or lines
    ///
    /// # Errors
    /// Returns `LoomError::Store` on storage failure.
    pub async fn search(&self, args: SearchArgs) -> LoomResult<Value> {
        let SearchArgs { field, query } = args;
        let lookup = query.clone();
        let results: SearchResults = self
            .scheduler
            .with_store(move |store| store.search(field, &lookup))
            .await?;
        Ok(json!({
            "results": results,
            "search": field.column(),
            "query": query,
        }))
    }

    /// Access log, newest first
    ///
    /// # Errors
    /// Returns `LoomError::Store` on storage failure.
    pub async fn recent(&self, args: RecentArgs) -> LoomResult<Value> {
        let RecentArgs {
            page_len,
            page,
            username_limit,
        } = args;
        let user = username_limit.clone();
        let entries = self
            .scheduler
            .with_store(move |store| store.recent(page_len, page, user.as_deref()))
            .await?;
        let mut response = json!({ "recent": entries });
        if let Some(user) = username_limit {
            response["username"] = json!(user);
        }
        Ok(response)
    }

    /// Scenes keyed by id
    ///
    /// # Errors
    /// Returns `LoomError::Store` on storage failure.
    pub async fn list_scenes(&self, args: ListScenesArgs) -> LoomResult<Value> {
        let ListScenesArgs {
            username_limit,
            outline_limit,
        } = args;
        let user = username_limit.clone();
        let scenes = self
            .scheduler
            .with_store(move |store| store.scenes(user.as_deref(), outline_limit))
            .await?;
        let listing: Map<String, Value> = scenes
            .into_iter()
            .map(|scene| {
                let entry = json!({
                    "prompt": scene.prompt,
                    "translated_prompt": scene.translated_prompt,
                    "username": scene.username,
                });
                (scene.key, entry)
            })
            .collect();

        let mut response = json!({ "scenes": listing });
        if let Some(user) = username_limit {
            response["username"] = json!(user);
        }
        Ok(response)
    }
}
