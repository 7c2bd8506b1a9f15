//! Ollama chat client.

use super::{Completion, CompletionRequest, ModelProvider};
use crate::error::{ProviderError, Result};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[async_trait::async_trait]
impl ModelProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|error| ProviderError::Request(format!("ollama request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "ollama returned {}",
                response.status()
            ))
            .into());
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Request(format!("bad ollama response: {error}")))?;

        Ok(Completion {
            content: parsed.message.content,
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|error| ProviderError::Request(format!("ollama request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "ollama returned {}",
                response.status()
            ))
            .into());
        }

        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Request(format!("bad ollama response: {error}")))?;
        Ok(parsed.models.into_iter().map(|entry| entry.name).collect())
    }
}
