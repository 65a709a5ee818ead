//! Ordered multi-provider fallback.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use workq_core::config::{ProviderConfig, ProviderKind};

use super::{AnthropicProvider, Completion, CompletionRequest, LlmProvider, OpenAiProvider};
use crate::backoff::Deadline;
use crate::client::ResilientClient;
use crate::error::ProviderError;

/// Tries each provider in order until one answers.
///
/// Each provider applies the backoff policy on its own; the chain only moves
/// on once a provider has given up. The error of the last provider tried is
/// returned when all fail.
pub struct ProviderChain {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    /// Build the chain from configuration, skipping entries without a key.
    pub fn from_config(
        configs: &[ProviderConfig],
        client: Arc<ResilientClient>,
        max_retries: u32,
    ) -> Self {
        let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
        for config in configs {
            if config.api_key.trim().is_empty() {
                warn!(model = %config.model, "Skipping language-model provider without an API key");
                continue;
            }
            let provider: Arc<dyn LlmProvider> = match config.kind {
                ProviderKind::OpenAi => {
                    Arc::new(OpenAiProvider::new(client.clone(), config, max_retries))
                }
                ProviderKind::Anthropic => {
                    Arc::new(AnthropicProvider::new(client.clone(), config, max_retries))
                }
            };
            providers.push(provider);
        }
        info!(count = providers.len(), "Language-model providers configured");
        Self { providers }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

#[async_trait]
impl LlmProvider for ProviderChain {
    fn name(&self) -> &str {
        self.providers.first().map(|p| p.name()).unwrap_or("none")
    }

    fn model(&self) -> &str {
        self.providers.first().map(|p| p.model()).unwrap_or("none")
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        deadline: &Deadline,
    ) -> Result<Completion, ProviderError> {
        let mut last_error = None;
        for provider in &self.providers {
            if deadline.is_expired() {
                break;
            }
            match provider.complete(request, deadline).await {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            if self.providers.is_empty() {
                ProviderError::Configuration(
                    "No language-model provider is configured. Add a [[providers]] entry and set \
                     WORKQ_OPENAI_API_KEY or WORKQ_ANTHROPIC_API_KEY."
                        .to_string(),
                )
            } else {
                ProviderError::DeadlineExceeded("language model".to_string())
            }
        }))
    }
}
