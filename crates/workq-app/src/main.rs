//! workq application binary - composition root.
//!
//! Ties together all workq crates into a single executable:
//! 1. Load configuration from TOML and overlay secrets from the environment
//! 2. Open the SQLite database (conversations, rate limits)
//! 3. Build the outbound clients (language models, REST and enhanced tracker)
//! 4. Wire the query orchestrator
//! 5. Serve the HTTP API, or run a one-shot command

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use workq_api::auth::generate_token;
use workq_api::{routes, AppState};
use workq_chat::{BackendSelector, MetadataCache, QueryOrchestrator, QueryRequest, ResultCache};
use workq_core::config::WorkqConfig;
use workq_core::types::QueryOptions;
use workq_provider::{
    BackoffPolicy, Deadline, EnhancedTracker, LlmProvider, ProviderChain, ResilientClient,
    RestTracker, WorkItemBackend,
};
use workq_storage::{ConversationStore, Database, RateLimitStore};

use cli::{CliArgs, Command, MetadataCommand};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Everything the commands need, built once from configuration.
struct Services {
    orchestrator: Arc<QueryOrchestrator>,
    rate_limits: Arc<RateLimitStore>,
}

fn build_services(config: &WorkqConfig) -> Result<Services, Box<dyn std::error::Error>> {
    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("workq.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let store = Arc::new(ConversationStore::new(
        Arc::clone(&db),
        config.conversation.clone(),
    ));
    let rate_limits = Arc::new(RateLimitStore::new(db));

    // Outbound clients share one backoff policy.
    let policy = BackoffPolicy::from(&config.retry);
    let max_retries = policy.max_retries;
    let client = Arc::new(ResilientClient::new(
        policy,
        Duration::from_secs(config.tracker.timeout_secs),
    )?);

    let chain = ProviderChain::from_config(&config.providers, Arc::clone(&client), max_retries);
    if chain.is_empty() {
        tracing::warn!("No language-model provider has an API key; answers use heuristics only");
    }
    let llm: Arc<dyn LlmProvider> = Arc::new(chain);

    let rest = Arc::new(RestTracker::new(
        Arc::clone(&client),
        config.tracker.clone(),
        max_retries,
    ));
    if let Err(e) = config.tracker.validate() {
        tracing::warn!(error = %e, "Work tracker is not fully configured");
    }
    let enhanced: Option<Arc<dyn WorkItemBackend>> = if config.tracker.enhanced_configured() {
        tracing::info!(url = %config.tracker.enhanced_url, "Enhanced query mode configured");
        Some(Arc::new(EnhancedTracker::new(
            Arc::clone(&client),
            &config.tracker,
            max_retries,
        )) as Arc<dyn WorkItemBackend>)
    } else {
        None
    };

    let result_cache = Arc::new(ResultCache::new(Duration::from_secs(
        config.cache.result_ttl_secs,
    )));
    let selector = Arc::new(BackendSelector::new(
        enhanced,
        rest.clone(),
        result_cache,
    ));
    let metadata = Arc::new(MetadataCache::new(
        rest,
        Duration::from_secs(config.cache.metadata_ttl_secs),
    ));

    let orchestrator = Arc::new(QueryOrchestrator::new(
        store,
        llm,
        selector,
        metadata,
        config.orchestrator.clone(),
        config.tracker.prefer_enhanced,
    ));

    Ok(Services {
        orchestrator,
        rate_limits,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = WorkqConfig::load_or_default(&config_file);
    config.apply_env_overrides();
    config.general.port = args.resolve_port(config.general.port);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.log_level.clone() {
        config.general.log_level = level;
    }

    // Tracing. RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting workq v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");

    match args.command() {
        Command::Token { email } => {
            let token = generate_token();
            println!("[auth.sessions]");
            println!("\"{}\" = \"{}\"", token, email);
        }
        Command::Serve => {
            let services = build_services(&config)?;
            let state = AppState::new(
                config.clone(),
                services.orchestrator,
                services.rate_limits,
            );
            if config.auth.sessions.is_empty() {
                tracing::warn!("No sessions configured; every protected endpoint will return 401");
            }
            if let Err(e) = routes::start_server(&config, state).await {
                tracing::error!(port = config.general.port, error = %e, "API server stopped");
                return Err(e.into());
            }
        }
        Command::Ask {
            query,
            user,
            conversation,
            skip_cache,
        } => {
            let services = build_services(&config)?;
            let result = services
                .orchestrator
                .process(QueryRequest {
                    query,
                    conversation_id: conversation,
                    user_id: user,
                    filters: Default::default(),
                    options: QueryOptions {
                        skip_cache,
                        verbose: true,
                    },
                })
                .await?;
            print_json(&result)?;
        }
        Command::Sweep { user } => {
            let services = build_services(&config)?;
            let deleted = services.orchestrator.store().sweep_inactive(&user)?;
            print_json(&serde_json::json!({ "deleted": deleted, "count": deleted.len() }))?;
        }
        Command::Metadata { action } => {
            let services = build_services(&config)?;
            let cache = services.orchestrator.metadata();
            let deadline = Deadline::after(Duration::from_secs(
                config.orchestrator.request_timeout_secs,
            ));
            match action {
                MetadataCommand::Preload => {
                    cache.preload_all(&deadline).await?;
                }
                MetadataCommand::Refresh => {
                    cache.refresh(&deadline).await?;
                }
                MetadataCommand::Stats => {}
            }
            print_json(&cache.stats())?;
        }
    }

    Ok(())
}
