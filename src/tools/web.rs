//! Guarded web fetch.

use super::policy::Guardrails;
use crate::error::{PolicyError, Result};
use std::sync::Arc;

/// Fetches URLs subject to the agent's web guardrails.
pub struct WebTool {
    client: reqwest::Client,
}

impl Default for WebTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// GET `url` and return the body as text. Disabled unless the guardrails
    /// enable web access; responses above the byte cap are rejected.
    pub async fn fetch(&self, url: &str, guardrails: &Arc<Guardrails>) -> Result<String> {
        if !guardrails.web.enabled {
            return Err(PolicyError::ToolForbidden {
                tool_id: "web.fetch".to_string(),
            }
            .into());
        }

        let timeout = std::time::Duration::from_secs(guardrails.web.fetch_timeout_secs);
        let response = match tokio::time::timeout(timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                return Err(PolicyError::Other(anyhow::anyhow!("fetch failed: {error}")).into());
            }
            Err(_) => {
                return Err(PolicyError::ToolTimeout {
                    seconds: guardrails.web.fetch_timeout_secs,
                }
                .into());
            }
        };

        if let Some(length) = response.content_length()
            && length > guardrails.web.max_fetch_bytes
        {
            return Err(PolicyError::OutputTooLarge {
                max_bytes: guardrails.web.max_fetch_bytes,
            }
            .into());
        }

        let body = match tokio::time::timeout(timeout, response.bytes()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) => {
                return Err(PolicyError::Other(anyhow::anyhow!("fetch body failed: {error}")).into());
            }
            Err(_) => {
                return Err(PolicyError::ToolTimeout {
                    seconds: guardrails.web.fetch_timeout_secs,
                }
                .into());
            }
        };

        if body.len() as u64 > guardrails.web.max_fetch_bytes {
            return Err(PolicyError::OutputTooLarge {
                max_bytes: guardrails.web.max_fetch_bytes,
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&body).to_string())
    }
}
