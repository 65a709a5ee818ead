//! Language-model providers.
//!
//! [`LlmProvider`] is the seam the chat pipeline depends on. Concrete
//! providers speak the OpenAI-compatible chat-completions API and the
//! Anthropic messages API; [`ProviderChain`] tries them in order.

mod anthropic;
mod chain;
mod openai;

pub use anthropic::AnthropicProvider;
pub use chain::ProviderChain;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use workq_core::types::Role;

use crate::backoff::Deadline;
use crate::error::ProviderError;

/// One prior turn passed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A provider-neutral completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatTurn>,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    /// Ask the provider for a JSON object when it supports doing so.
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            system: Some(system.into()),
            messages,
            max_tokens: None,
            temperature: 0.2,
            json_output: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// Text produced by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub provider: String,
    pub model: String,
    /// Prompt plus completion tokens as reported by the provider.
    pub tokens: u64,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider name used in logs and `dataSources`.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
        deadline: &Deadline,
    ) -> Result<Completion, ProviderError>;
}
