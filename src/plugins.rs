//! Channel-plugin bridge: outbound delivery to registered plugins.
//!
//! Plugins POST inbound messages to `/v1/channels/{id}/messages` themselves;
//! the runtime only needs the outbound half: POST `{baseUrl}/deliver` for
//! replies, and an optional `{baseUrl}/validate` gate on ingest. Unimplemented
//! endpoints are treated as allowed. No retry in v1.

use crate::error::Result;
use crate::persist::{AggregateKind, Backend};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A registered channel plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    pub id: String,
    pub base_url: String,
    /// The channel this plugin bridges.
    pub channel_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Validation verdict from a plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateResponse {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    channel_id: &'a str,
    user_id: &'a str,
    content: &'a str,
}

pub struct PluginManager {
    backend: Arc<dyn Backend>,
    client: reqwest::Client,
}

impl PluginManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            client: reqwest::Client::new(),
        }
    }

    pub async fn register(&self, base_url: &str, channel_id: &str) -> Result<Plugin> {
        let plugin = Plugin {
            id: uuid::Uuid::new_v4().to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            channel_id: channel_id.to_string(),
            version: 1,
            created_at: Utc::now(),
        };
        self.backend
            .put_aggregate(
                AggregateKind::Plugins,
                &plugin.id,
                serde_json::to_value(&plugin).context("serialize plugin")?,
            )
            .await?;
        Ok(plugin)
    }

    pub async fn list(&self) -> Result<Vec<Plugin>> {
        let rows = self.backend.list_aggregates(AggregateKind::Plugins).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(_, body)| serde_json::from_value(body).ok())
            .collect())
    }

    /// The plugin bridging `channel_id`, if registered.
    pub async fn for_channel(&self, channel_id: &str) -> Result<Option<Plugin>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|plugin| plugin.channel_id == channel_id))
    }

    /// Ask the channel's plugin whether this inbound message is allowed.
    /// Channels without a plugin, plugins without `/validate`, and transport
    /// failures are all allowed; validation is an optional tightening.
    pub async fn validate_inbound(
        &self,
        channel_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<ValidateResponse> {
        let Some(plugin) = self.for_channel(channel_id).await? else {
            return Ok(ValidateResponse {
                allowed: true,
                reason: None,
            });
        };

        let response = self
            .client
            .post(format!("{}/validate", plugin.base_url))
            .json(&OutboundMessage {
                channel_id,
                user_id,
                content,
            })
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<ValidateResponse>().await {
                    Ok(verdict) => Ok(verdict),
                    Err(error) => {
                        tracing::warn!(%error, plugin_id = %plugin.id, "bad validate response, allowing");
                        Ok(ValidateResponse {
                            allowed: true,
                            reason: None,
                        })
                    }
                }
            }
            Ok(_) | Err(_) => Ok(ValidateResponse {
                allowed: true,
                reason: None,
            }),
        }
    }

    /// Deliver an outbound message to the channel's plugin, if any. Failures
    /// are logged and dropped; at-least-once is the ingest side's job.
    pub async fn deliver(&self, channel_id: &str, user_id: &str, content: &str) {
        let plugin = match self.for_channel(channel_id).await {
            Ok(Some(plugin)) => plugin,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%error, channel_id, "plugin lookup failed");
                return;
            }
        };

        let result = self
            .client
            .post(format!("{}/deliver", plugin.base_url))
            .json(&OutboundMessage {
                channel_id,
                user_id,
                content,
            })
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(
                    plugin_id = %plugin.id,
                    status = %response.status(),
                    "plugin deliver rejected"
                );
            }
            Err(error) => {
                tracing::warn!(plugin_id = %plugin.id, %error, "plugin deliver failed");
            }
        }
    }
}
