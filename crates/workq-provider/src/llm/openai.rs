//! OpenAI-compatible chat-completions provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use workq_core::config::ProviderConfig;

use super::{Completion, CompletionRequest, LlmProvider};
use crate::backoff::Deadline;
use crate::client::{RequestSpec, ResilientClient};
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Arc<ResilientClient>,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

impl OpenAiProvider {
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

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for turn in &request.messages {
            messages.push(json!({"role": turn.role.as_str(), "content": turn.content}));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": request.temperature,
        });
        if request.json_output {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
            format!("{}/chat/completions", self.base_url),
            self.request_body(request),
        )
        .header("Authorization", format!("Bearer {}", self.api_key))
        .idempotent(true);

        let response = self.client.call(&spec, self.max_retries, deadline).await?;
        let parsed: ChatCompletionResponse = serde_json::from_value(response.body)
            .map_err(|e| ProviderError::invalid_response(self.name(), e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProviderError::invalid_response(self.name(), "no completion text"))?;

        Ok(Completion {
            text,
            provider: self.name().to_string(),
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}
