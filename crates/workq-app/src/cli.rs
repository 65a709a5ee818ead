//! CLI argument definitions for the workq binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// workq - ask questions about your team's work items in plain language.
#[derive(Parser, Debug)]
#[command(name = "workq", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<u16>,

    /// Data directory for the SQLite database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP API (default).
    Serve,
    /// Answer one question and print the result as JSON.
    Ask {
        query: String,
        /// Email of the asking user.
        #[arg(short = 'u', long = "user")]
        user: String,
        /// Continue an existing conversation.
        #[arg(long = "conversation")]
        conversation: Option<uuid::Uuid>,
        /// Bypass cached results and reference data.
        #[arg(long = "skip-cache")]
        skip_cache: bool,
    },
    /// Delete the user's conversations idle past the retention window.
    Sweep {
        #[arg(short = 'u', long = "user")]
        user: String,
    },
    /// Work with the reference-data cache.
    Metadata {
        #[arg(value_enum)]
        action: MetadataCommand,
    },
    /// Issue a session token for a user and print the config entry.
    Token {
        #[arg(short = 'e', long = "email")]
        email: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataCommand {
    /// Load the snapshot unless a fresh one is cached.
    Preload,
    /// Fetch every category again.
    Refresh,
    /// Show cache state without fetching.
    Stats,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > WORKQ_CONFIG env var > platform default (~/.workq/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("WORKQ_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the API server port.
    ///
    /// Priority: --port flag > WORKQ_PORT env var > config file value.
    pub fn resolve_port(&self, config_port: u16) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        std::env::var("WORKQ_PORT")
            .ok()
            .and_then(|val| val.parse::<u16>().ok())
            .unwrap_or(config_port)
    }

    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".workq").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".workq").join("config.toml");
    }
    PathBuf::from("config.toml")
}
