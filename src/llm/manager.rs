//! Provider manager: hot-reloadable selection of the active model provider.
//!
//! Config updates swap the whole provider state atomically; in-flight calls
//! finish against the snapshot they started with.

use super::{ollama::OllamaProvider, openai::OpenAiProvider};
use super::{ChatMessage, Completion, CompletionRequest, ModelProvider};
use crate::config::{ConfigHandle, ProviderConfig, ProviderKind};
use crate::error::{ProviderError, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;

struct ProviderState {
    provider: Option<Arc<dyn ModelProvider>>,
    models: Vec<String>,
    key_present: bool,
}

impl ProviderState {
    fn from_config(config: &ProviderConfig) -> Self {
        if config.models.is_empty() {
            // No models selected: unconfigured, callers take the inline
            // fallback path.
            let key_present =
                config.api_key.is_some() || std::env::var("OPENAI_API_KEY").is_ok();
            return Self {
                provider: None,
                models: Vec::new(),
                key_present,
            };
        }

        let (provider, key_present): (Arc<dyn ModelProvider>, bool) = match config.kind {
            ProviderKind::Openai => {
                let provider = OpenAiProvider::new(
                    config.base_url.clone(),
                    config.api_key.clone(),
                    config.request_timeout_secs,
                );
                let key_present = provider.has_key();
                (Arc::new(provider), key_present)
            }
            ProviderKind::Ollama => (
                Arc::new(OllamaProvider::new(
                    config.base_url.clone(),
                    config.request_timeout_secs,
                )),
                true,
            ),
        };

        Self {
            provider: Some(provider),
            models: config.models.clone(),
            key_present,
        }
    }
}

/// Key/configuration status reported by the API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub configured: bool,
    pub key_present: bool,
    pub models: Vec<String>,
}

/// Hot-swappable provider handle shared across the runtime.
pub struct LlmManager {
    state: ArcSwap<ProviderState>,
}

impl LlmManager {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self {
            state: ArcSwap::from_pointee(ProviderState::from_config(&config.load().provider)),
        }
    }

    /// Rebuild the provider from a new config snapshot. Called on
    /// `PUT /v1/config`.
    pub fn reload(&self, config: &ProviderConfig) {
        self.state.store(Arc::new(ProviderState::from_config(config)));
        tracing::info!(
            models = config.models.len(),
            kind = ?config.kind,
            "model provider reloaded"
        );
    }

    /// Whether a model is configured (so branches/replies can use it).
    pub fn configured(&self) -> bool {
        let state = self.state.load();
        state.provider.is_some() && !state.models.is_empty()
    }

    pub fn status(&self) -> ProviderStatus {
        let state = self.state.load();
        ProviderStatus {
            configured: state.provider.is_some(),
            key_present: state.key_present,
            models: state.models.clone(),
        }
    }

    /// Complete against the default (first configured) model.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    ) -> Result<Completion> {
        let state = self.state.load_full();
        let provider = state
            .provider
            .as_ref()
            .ok_or(ProviderError::Unconfigured)?;
        let model = state
            .models
            .first()
            .cloned()
            .ok_or(ProviderError::Unconfigured)?;

        provider
            .complete(CompletionRequest {
                model,
                messages,
                max_tokens,
            })
            .await
    }

    /// Remote model catalog, for `POST /v1/providers/openai/models`.
    pub async fn list_remote_models(&self) -> Result<Vec<String>> {
        let state = self.state.load_full();
        let provider = state
            .provider
            .as_ref()
            .ok_or(ProviderError::Unconfigured)?;
        provider.list_models().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn empty_models_means_unconfigured() {
        let manager = LlmManager::new(ConfigHandle::new(RuntimeConfig::default()));
        assert!(!manager.configured());
        let status = manager.status();
        assert!(!status.configured);
        assert!(status.models.is_empty());
    }

    #[test]
    fn reload_flips_configured() {
        let manager = LlmManager::new(ConfigHandle::new(RuntimeConfig::default()));
        assert!(!manager.configured());

        let mut provider = ProviderConfig::default();
        provider.kind = ProviderKind::Ollama;
        provider.models = vec!["llama3".to_string()];
        manager.reload(&provider);
        assert!(manager.configured());

        provider.models.clear();
        manager.reload(&provider);
        assert!(!manager.configured());
    }

    #[tokio::test]
    async fn unconfigured_complete_is_provider_unavailable() {
        let manager = LlmManager::new(ConfigHandle::new(RuntimeConfig::default()));
        let error = manager
            .complete(vec![ChatMessage::user("hi")], 128)
            .await
            .expect_err("unconfigured must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::ProviderUnavailable);
    }
}
