//! OpenAI-compatible chat completions client.

use super::{ChatMessage, Completion, CompletionRequest, ModelProvider};
use crate::error::{ProviderError, Result};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    /// `api_key` falls back to `OPENAI_API_KEY` when unset.
    pub fn new(base_url: Option<String>, api_key: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok()),
        }
    }

    pub fn has_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn bearer(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Request("missing OPENAI_API_KEY".to_string()).into())
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait::async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let key = self.bearer()?;
        let messages: Vec<ChatMessage> = request.messages;
        let body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|error| ProviderError::Request(format!("openai request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "openai returned {}",
                response.status()
            ))
            .into());
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Request(format!("bad openai response: {error}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let key = self.bearer()?;
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(key)
            .send()
            .await
            .map_err(|error| ProviderError::Request(format!("openai request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "openai returned {}",
                response.status()
            ))
            .into());
        }

        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Request(format!("bad openai response: {error}")))?;
        Ok(parsed.data.into_iter().map(|entry| entry.id).collect())
    }
}
