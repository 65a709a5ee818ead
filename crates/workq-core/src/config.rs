use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WorkqError};

/// Environment variable holding the tracker personal access token.
pub const ENV_TRACKER_TOKEN: &str = "WORKQ_TRACKER_TOKEN";
/// Environment variable holding the OpenAI-compatible provider key.
pub const ENV_OPENAI_API_KEY: &str = "WORKQ_OPENAI_API_KEY";
/// Environment variable holding the Anthropic provider key.
pub const ENV_ANTHROPIC_API_KEY: &str = "WORKQ_ANTHROPIC_API_KEY";

/// Top-level configuration for workq.
///
/// Loaded from `~/.workq/config.toml` by default. Each section corresponds
/// to a bounded context or cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkqConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl WorkqConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WorkqConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Overlay secrets from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay secrets using an arbitrary lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_TRACKER_TOKEN).filter(|t| !t.is_empty()) {
            self.tracker.token = token;
        }
        for provider in &mut self.providers {
            let env_key = match provider.kind {
                ProviderKind::OpenAi => ENV_OPENAI_API_KEY,
                ProviderKind::Anthropic => ENV_ANTHROPIC_API_KEY,
            };
            if provider.api_key.is_empty() {
                if let Some(key) = lookup(env_key).filter(|k| !k.is_empty()) {
                    provider.api_key = key;
                }
            }
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// API server port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.workq/data".to_string(),
            log_level: "info".to_string(),
            port: 3040,
        }
    }
}

/// Session verification settings.
///
/// Sessions are issued elsewhere; this maps bearer tokens to the email
/// of the user they were issued for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub sessions: BTreeMap<String, String>,
}

/// Work-tracking backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// REST API base URL.
    pub base_url: String,
    pub organization: String,
    pub project: String,
    /// Team used for sprint and member lookups.
    pub team: String,
    /// Personal access token. Usually supplied via `WORKQ_TRACKER_TOKEN`.
    pub token: String,
    pub api_version: String,
    /// Endpoint of the enhanced query service. Empty disables enhanced mode.
    pub enhanced_url: String,
    /// Try enhanced mode before REST when it is configured.
    pub prefer_enhanced: bool,
    /// Per-call HTTP timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dev.azure.com".to_string(),
            organization: String::new(),
            project: String::new(),
            team: String::new(),
            token: String::new(),
            api_version: "7.1".to_string(),
            enhanced_url: String::new(),
            prefer_enhanced: true,
            timeout_secs: 30,
        }
    }
}

impl TrackerConfig {
    /// Check that every setting REST mode needs is present.
    ///
    /// The error message names each missing setting and how to supply it.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.base_url.trim().is_empty() {
            missing.push("tracker.base_url".to_string());
        }
        if self.organization.trim().is_empty() {
            missing.push("tracker.organization".to_string());
        }
        if self.project.trim().is_empty() {
            missing.push("tracker.project".to_string());
        }
        if self.token.trim().is_empty() {
            missing.push(format!("tracker.token (or {})", ENV_TRACKER_TOKEN));
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(WorkqError::Config(format!(
                "Work tracker is not configured. Set {} in config.toml.",
                missing.join(", ")
            )))
        }
    }

    /// Whether an enhanced-mode endpoint is configured.
    pub fn enhanced_configured(&self) -> bool {
        !self.enhanced_url.trim().is_empty()
    }
}

/// Language-model provider flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions API.
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
}

/// One entry of the ordered provider fallback list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_provider_timeout() -> u64 {
    60
}

/// Backoff policy for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 250,
        }
    }
}

/// Cache lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Metadata snapshots older than this are treated as a miss.
    pub metadata_ttl_secs: u64,
    /// Lifetime of cached backend query results.
    pub result_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: 3600,
            result_ttl_secs: 120,
        }
    }
}

/// Conversation store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Recent messages included in prompts.
    pub context_messages: usize,
    /// Conversations idle longer than this are eligible for the sweep.
    pub retention_days: i64,
    pub title_chars: usize,
    pub preview_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            context_messages: 10,
            retention_days: 5,
            title_chars: 50,
            preview_chars: 100,
        }
    }
}

/// Query pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard wall-clock budget for one query.
    pub request_timeout_secs: u64,
    pub max_suggestions: usize,
    /// Items passed to the synthesis prompt.
    pub max_items_for_synthesis: usize,
    pub default_model: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 45,
            max_suggestions: 4,
            max_items_for_synthesis: 50,
            default_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Per-identity usage ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub chat_per_window: u32,
    pub metadata_refresh_per_window: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            chat_per_window: 30,
            metadata_refresh_per_window: 5,
            window_secs: 600,
        }
    }
}
