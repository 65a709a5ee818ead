//! Anthropic messages-API provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use workq_core::config::ProviderConfig;
use workq_core::types::Role;

use super::{Completion, CompletionRequest, LlmProvider};
use crate::backoff::Deadline;
use crate::client::{RequestSpec, ResilientClient};
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Arc<ResilientClient>,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicProvider {
    pub fn new(client: Arc<ResilientClient>, config: &ProviderConfig, max_retries: u32) -> Self {
        let base_url = if config.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            config.base_url.trim_end_matches('/').to_string()
        };
        Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries,
        }
    }

    /// System turns are folded into the top-level `system` field; the
    /// message list must open with a user turn.
    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut system: Vec<&str> = request.system.iter().map(String::as_str).collect();
        let mut messages = Vec::with_capacity(request.messages.len());
        for turn in &request.messages {
            match turn.role {
                Role::System => system.push(&turn.content),
                Role::Assistant if messages.is_empty() => {}
                role => messages.push(json!({"role": role.as_str(), "content": turn.content})),
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": request.temperature,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }
        body
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        deadline: &Deadline,
    ) -> Result<Completion, ProviderError> {
        let spec = RequestSpec::post(
            self.name(),
            format!("{}/v1/messages", self.base_url),
            self.request_body(request),
        )
        .header("x-api-key", self.api_key.clone())
        .header("anthropic-version", API_VERSION)
        .idempotent(true);

        let response = self.client.call(&spec, self.max_retries, deadline).await?;
        let parsed: MessageResponse = serde_json::from_value(response.body)
            .map_err(|e| ProviderError::invalid_response(self.name(), e.to_string()))?;

        let text: String = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(ProviderError::invalid_response(self.name(), "no text content"));
        }

        Ok(Completion {
            text,
            provider: self.name().to_string(),
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            tokens: parsed
                .usage
                .map(|u| u.input_tokens + u.output_tokens)
                .unwrap_or(0),
        })
    }
}
