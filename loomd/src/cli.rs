//! Command line and configuration file

use anyhow::{Context, Result};
use clap::Parser;
use loom_core::LoomConfig;
use std::path::{Path, PathBuf};

/// Loom daemon: collaborative branching dialogue server
#[derive(Parser, Debug, Clone)]
#[command(name = "loomd", version, about)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Read requests from stdin instead of listening on TCP
    #[arg(long)]
    pub console: bool,

    /// Interface to listen on
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// SQLite database file
    #[arg(short, long)]
    pub database: Option<PathBuf>,

    /// Shell command serving the language model over JSON lines
    #[arg(short, long)]
    pub model_command: String,

    /// Check lines with the entailment scorer of the model process
    #[arg(long)]
    pub nli: bool,

    /// Summarize prompts that no longer fit the model context
    #[arg(long)]
    pub summarize: bool,

    /// Shell command translating stdin to stdout
    #[arg(long)]
    pub translate_command: Option<String>,

    /// Insert outline sentences as stage directions
    #[arg(long)]
    pub outlines: bool,

    /// Prose mode: sentence stops and no speaker names
    #[arg(long)]
    pub prose: bool,

    /// Successive lines generated per job
    #[arg(short, long)]
    pub alternatives: Option<usize>,

    /// Log level, unless RUST_LOG is set
    #[arg(long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: String,
}

impl Cli {
    /// Load the configuration file, if any, then apply flags over it
    ///
    /// # Errors
    /// Fails if the file cannot be read or parsed.
    pub fn load_config(&self) -> Result<LoomConfig> {
        let config = match &self.config {
            Some(path) => read_config(path)?,
            None => LoomConfig::new(),
        };
        Ok(self.apply(config))
    }

    /// Apply command line overrides
    #[must_use]
    pub fn apply(&self, mut config: LoomConfig) -> LoomConfig {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(database) = &self.database {
            config = config.with_database(database);
        }
        if let Some(alternatives) = self.alternatives {
            config = config.with_alternatives(alternatives);
        }
        if self.outlines {
            config = config.with_outlines(true);
        }
        if self.prose {
            let generation = config.generation.clone().with_prose(true);
            config = config.with_generation(generation);
        }
        config
    }
}

/// Parse a TOML configuration file
///
/// # Errors
/// Fails if the file cannot be read or parsed.
pub fn read_config(path: &Path) -> Result<LoomConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))
}
