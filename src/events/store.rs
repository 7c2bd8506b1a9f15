//! Event store: append/read over the persistence adapter, snapshot
//! derivation, and the broadcast fan-out every observer hangs off.

use super::envelope::{EventEnvelope, MessageBody};
use crate::agent::router::RouteDecision;
use crate::config::ConfigHandle;
use crate::error::Result;
use crate::persist::{Backend, KeyedLocks, NewEvent};
use crate::WorkerId;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// An envelope together with its append position.
#[derive(Debug, Clone)]
pub struct StoredEnvelope {
    pub position: u64,
    pub envelope: EventEnvelope,
}

/// One entry in a channel's derived message view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    pub role: String,
    pub content: String,
    pub ts: DateTime<Utc>,
    pub message_id: String,
}

/// Log-derived view of a channel, recomputed after any append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub messages: Vec<SnapshotMessage>,
    pub context_utilization: f64,
    pub active_worker_ids: BTreeSet<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<RouteDecision>,
}

impl ChannelSnapshot {
    pub fn empty(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            messages: Vec::new(),
            context_utilization: 0.0,
            active_worker_ids: BTreeSet::new(),
            last_decision: None,
        }
    }
}

/// Rough token estimate for utilization accounting. Four characters per
/// token, plus per-message framing overhead.
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4) + 8
}

/// The append-only log per channel, with global message-id dedup.
pub struct EventStore {
    backend: Arc<dyn Backend>,
    config: Arc<ConfigHandle>,
    event_tx: broadcast::Sender<StoredEnvelope>,
    channel_locks: KeyedLocks,
}

impl EventStore {
    pub fn new(backend: Arc<dyn Backend>, config: Arc<ConfigHandle>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            backend,
            config,
            event_tx,
            channel_locks: KeyedLocks::new(),
        }
    }

    /// Subscribe to every append, across channels.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredEnvelope> {
        self.event_tx.subscribe()
    }

    /// The serialization lock for one channel. The dispatcher holds it across
    /// message append → route decision → decision append so the decision's
    /// position is always greater than its trigger's.
    pub fn channel_lock(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.channel_locks.lock_for(channel_id)
    }

    /// Append an envelope; returns its position in the channel log.
    ///
    /// Fails with `duplicate_message_id` if the id was ever appended, on any
    /// channel. The append is atomic with respect to concurrent readers.
    pub async fn append(&self, envelope: EventEnvelope) -> Result<u64> {
        let position = self
            .backend
            .append_event(
                &envelope.channel_id,
                NewEvent {
                    message_id: envelope.message_id.clone(),
                    message_type: envelope.message_type().to_string(),
                    ts: envelope.ts,
                    payload: envelope.encode(),
                },
            )
            .await?;

        tracing::debug!(
            channel_id = %envelope.channel_id,
            message_type = envelope.message_type(),
            position,
            "event appended"
        );

        let _ = self.event_tx.send(StoredEnvelope { position, envelope });
        Ok(position)
    }

    /// All envelopes from `from_position` (inclusive), decoded.
    pub async fn read(&self, channel_id: &str, from_position: u64) -> Result<Vec<StoredEnvelope>> {
        let records = self
            .backend
            .scan_events(channel_id, from_position, None)
            .await?;
        let mut envelopes = Vec::with_capacity(records.len());
        for record in records {
            match EventEnvelope::decode(&record.payload) {
                Ok(envelope) => envelopes.push(StoredEnvelope {
                    position: record.position,
                    envelope,
                }),
                Err(error) => {
                    tracing::warn!(
                        channel_id,
                        position = record.position,
                        %error,
                        "skipping undecodable envelope"
                    );
                }
            }
        }
        Ok(envelopes)
    }

    /// Lazy paged read from `from_position`.
    pub fn read_stream(
        self: &Arc<Self>,
        channel_id: String,
        from_position: u64,
    ) -> impl Stream<Item = Result<StoredEnvelope>> + Send + 'static {
        const PAGE: u32 = 128;
        let store = Arc::clone(self);
        async_stream::try_stream! {
            let mut cursor = from_position.max(1);
            loop {
                let records = store
                    .backend
                    .scan_events(&channel_id, cursor, Some(PAGE))
                    .await?;
                if records.is_empty() {
                    break;
                }
                for record in records {
                    cursor = record.position + 1;
                    if let Ok(envelope) = EventEnvelope::decode(&record.payload) {
                        yield StoredEnvelope {
                            position: record.position,
                            envelope,
                        };
                    }
                }
            }
        }
    }

    /// Replace the contiguous run `[first, last]` with a single summary
    /// envelope, then broadcast it. Compactor-only.
    pub async fn replace_run(
        &self,
        channel_id: &str,
        first: u64,
        last: u64,
        summary: EventEnvelope,
    ) -> Result<u64> {
        let position = self
            .backend
            .replace_events(
                channel_id,
                first,
                last,
                NewEvent {
                    message_id: summary.message_id.clone(),
                    message_type: summary.message_type().to_string(),
                    ts: summary.ts,
                    payload: summary.encode(),
                },
            )
            .await?;
        let _ = self.event_tx.send(StoredEnvelope {
            position,
            envelope: summary,
        });
        Ok(position)
    }

    /// Channel ids with at least one event.
    pub async fn list_channels(&self) -> Result<Vec<String>> {
        self.backend.list_channels().await
    }

    /// Derive the channel snapshot from the log. Unknown channels yield an
    /// empty snapshot, not an error.
    pub async fn snapshot(&self, channel_id: &str) -> Result<ChannelSnapshot> {
        let stored = self.read(channel_id, 1).await?;
        let mut snapshot = ChannelSnapshot::empty(channel_id);
        let mut token_total: u64 = 0;

        for StoredEnvelope { envelope, .. } in &stored {
            let message = match &envelope.body {
                MessageBody::ChannelMessageReceived { content, .. } => {
                    Some(("user", content.clone()))
                }
                MessageBody::ChannelReplySent { content, .. } => Some(("system", content.clone())),
                MessageBody::BranchConclusion(conclusion) => {
                    Some(("system", conclusion.summary.clone()))
                }
                MessageBody::WorkerCompleted { report, .. } => Some(("system", report.clone())),
                MessageBody::WorkerFailed { reason, .. } => {
                    Some(("system", format!("worker failed: {reason}")))
                }
                MessageBody::CompactorSummaryApplied { digest, .. } => {
                    Some(("system", digest.clone()))
                }
                MessageBody::ChannelRouteDecided { decision, .. } => {
                    snapshot.last_decision = Some(decision.clone());
                    None
                }
                MessageBody::WorkerSpawned { .. } => {
                    if let Some(worker_id) = envelope.worker_id {
                        snapshot.active_worker_ids.insert(worker_id);
                    }
                    None
                }
                _ => None,
            };

            match &envelope.body {
                MessageBody::WorkerCompleted { .. } | MessageBody::WorkerFailed { .. } => {
                    if let Some(worker_id) = envelope.worker_id {
                        snapshot.active_worker_ids.remove(&worker_id);
                    }
                }
                _ => {}
            }

            if let Some((role, content)) = message {
                token_total += estimate_tokens(&content);
                snapshot.messages.push(SnapshotMessage {
                    role: role.to_string(),
                    content,
                    ts: envelope.ts,
                    message_id: envelope.message_id.clone(),
                });
            }
        }

        let budget = self.config.load().channel.context_window_tokens.max(1);
        snapshot.context_utilization = (token_total as f64 / budget as f64).min(1.0);
        Ok(snapshot)
    }

    /// Positions and token weights of the snapshot-visible messages, oldest
    /// first. The compactor uses this to pick the run to summarize.
    pub async fn message_weights(&self, channel_id: &str) -> Result<Vec<(u64, u64, String)>> {
        let stored = self.read(channel_id, 1).await?;
        let mut weights = Vec::new();
        for StoredEnvelope { position, envelope } in stored {
            let content = match &envelope.body {
                MessageBody::ChannelMessageReceived { content, .. } => Some(content.clone()),
                MessageBody::ChannelReplySent { content, .. } => Some(content.clone()),
                MessageBody::BranchConclusion(conclusion) => Some(conclusion.summary.clone()),
                MessageBody::WorkerCompleted { report, .. } => Some(report.clone()),
                MessageBody::WorkerFailed { reason, .. } => Some(reason.clone()),
                MessageBody::CompactorSummaryApplied { digest, .. } => Some(digest.clone()),
                _ => None,
            };
            if let Some(content) = content {
                weights.push((position, estimate_tokens(&content), envelope.message_id));
            }
        }
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::persist::MemoryBackend;

    fn store() -> Arc<EventStore> {
        let config = ConfigHandle::new(RuntimeConfig::default());
        Arc::new(EventStore::new(MemoryBackend::new(), config))
    }

    fn message(channel: &str, content: &str) -> EventEnvelope {
        EventEnvelope::new(
            channel,
            uuid::Uuid::new_v4().to_string(),
            MessageBody::ChannelMessageReceived {
                user_id: "u1".into(),
                content: content.into(),
                extra: serde_json::Map::new(),
            },
        )
    }

    #[tokio::test]
    async fn snapshot_tracks_messages_and_decision() {
        let store = store();
        store.append(message("general", "hello there")).await.unwrap();

        let decision = RouteDecision {
            action: crate::agent::router::RouteAction::Respond,
            reason: "short_conversational".into(),
            confidence: 0.8,
            token_budget: 1200,
        };
        store
            .append(EventEnvelope::new(
                "general",
                "trace-1",
                MessageBody::ChannelRouteDecided {
                    decision: decision.clone(),
                    extra: serde_json::Map::new(),
                },
            ))
            .await
            .unwrap();
        store
            .append(EventEnvelope::new(
                "general",
                "trace-1",
                MessageBody::ChannelReplySent {
                    content: "Responded inline".into(),
                    via_provider: false,
                    extra: serde_json::Map::new(),
                },
            ))
            .await
            .unwrap();

        let snapshot = store.snapshot("general").await.unwrap();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, "user");
        assert_eq!(snapshot.messages[1].role, "system");
        assert_eq!(snapshot.messages[1].content, "Responded inline");
        assert_eq!(snapshot.last_decision, Some(decision));
        assert!(snapshot.context_utilization > 0.0);
    }

    #[tokio::test]
    async fn snapshot_tracks_active_workers() {
        let store = store();
        let worker_id = uuid::Uuid::new_v4();
        store
            .append(
                EventEnvelope::new(
                    "general",
                    "trace-1",
                    MessageBody::WorkerSpawned {
                        title: "t".into(),
                        objective: "o".into(),
                        mode: "interactive".into(),
                        extra: serde_json::Map::new(),
                    },
                )
                .with_worker(worker_id),
            )
            .await
            .unwrap();

        let snapshot = store.snapshot("general").await.unwrap();
        assert!(snapshot.active_worker_ids.contains(&worker_id));

        store
            .append(
                EventEnvelope::new(
                    "general",
                    "trace-1",
                    MessageBody::WorkerCompleted {
                        report: "done".into(),
                        extra: serde_json::Map::new(),
                    },
                )
                .with_worker(worker_id),
            )
            .await
            .unwrap();

        let snapshot = store.snapshot("general").await.unwrap();
        assert!(snapshot.active_worker_ids.is_empty());
    }

    #[tokio::test]
    async fn timestamps_are_non_decreasing_by_position() {
        let store = store();
        for n in 0..5 {
            store
                .append(message("general", &format!("message {n}")))
                .await
                .unwrap();
        }
        let stored = store.read("general", 1).await.unwrap();
        for pair in stored.windows(2) {
            assert!(pair[0].envelope.ts <= pair[1].envelope.ts);
            assert!(pair[0].position < pair[1].position);
        }
    }

    #[tokio::test]
    async fn unknown_channel_yields_empty_snapshot() {
        let store = store();
        let snapshot = store.snapshot("nowhere").await.unwrap();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.context_utilization, 0.0);
    }

    #[tokio::test]
    async fn read_stream_pages_through_the_log() {
        use futures::TryStreamExt as _;

        let store = store();
        for n in 0..300 {
            store
                .append(message("general", &format!("message {n}")))
                .await
                .unwrap();
        }

        // 300 events span multiple pages; the stream sees all of them from
        // an arbitrary starting position.
        let collected: Vec<StoredEnvelope> = store
            .read_stream("general".to_string(), 42)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(collected.len(), 259);
        assert_eq!(collected[0].position, 42);
        assert_eq!(collected.last().unwrap().position, 300);
    }

    #[tokio::test]
    async fn broadcast_carries_appends_in_order() {
        let store = store();
        let mut rx = store.subscribe();
        store.append(message("general", "one")).await.unwrap();
        store.append(message("general", "two")).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(second.position, 2);
    }
}
