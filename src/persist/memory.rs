//! In-memory persistence backend for tests.
//!
//! Mirrors the SQLite backend's semantics exactly: per-channel total order,
//! global message-id uniqueness, per-aggregate write serialization.

use super::{AggregateKind, Backend, EventRecord, KeyedLocks, NewEvent};
use crate::error::{Result, StoreError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    /// channel id -> position -> record. BTreeMap keeps scans ordered.
    logs: HashMap<String, BTreeMap<u64, EventRecord>>,
    /// Global message-id uniqueness set.
    message_ids: HashSet<String>,
    aggregates: HashMap<(AggregateKind, String), serde_json::Value>,
}

/// Purely in-memory [`Backend`] implementation.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    aggregate_locks: KeyedLocks,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            aggregate_locks: KeyedLocks::new(),
        })
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn append_event(&self, channel_id: &str, event: NewEvent) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.message_ids.contains(&event.message_id) {
            return Err(StoreError::DuplicateMessageId {
                message_id: event.message_id,
            }
            .into());
        }

        let log = inner.logs.entry(channel_id.to_string()).or_default();
        let position = log.keys().next_back().copied().unwrap_or(0) + 1;
        log.insert(
            position,
            EventRecord {
                position,
                message_id: event.message_id.clone(),
                message_type: event.message_type,
                ts: event.ts,
                payload: event.payload,
            },
        );
        inner.message_ids.insert(event.message_id);
        Ok(position)
    }

    async fn scan_events(
        &self,
        channel_id: &str,
        from_position: u64,
        limit: Option<u32>,
    ) -> Result<Vec<EventRecord>> {
        let inner = self.inner.lock().await;
        let Some(log) = inner.logs.get(channel_id) else {
            return Ok(Vec::new());
        };
        let records = log
            .range(from_position.max(1)..)
            .map(|(_, record)| record.clone());
        Ok(match limit {
            Some(limit) => records.take(limit as usize).collect(),
            None => records.collect(),
        })
    }

    async fn replace_events(
        &self,
        channel_id: &str,
        first: u64,
        last: u64,
        summary: NewEvent,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.message_ids.contains(&summary.message_id) {
            return Err(StoreError::DuplicateMessageId {
                message_id: summary.message_id,
            }
            .into());
        }

        let log = inner
            .logs
            .get_mut(channel_id)
            .ok_or_else(|| StoreError::Query(format!("no log for channel {channel_id}")))?;
        let removed: Vec<u64> = log.range(first..=last).map(|(p, _)| *p).collect();
        for position in removed {
            log.remove(&position);
        }
        log.insert(
            first,
            EventRecord {
                position: first,
                message_id: summary.message_id.clone(),
                message_type: summary.message_type,
                ts: summary.ts,
                payload: summary.payload,
            },
        );
        inner.message_ids.insert(summary.message_id);
        Ok(first)
    }

    async fn list_channels(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut channels: Vec<String> = inner.logs.keys().cloned().collect();
        channels.sort();
        Ok(channels)
    }

    async fn put_aggregate(
        &self,
        kind: AggregateKind,
        id: &str,
        body: serde_json::Value,
    ) -> Result<()> {
        let lock = self.aggregate_locks.lock_for(&format!("{kind}:{id}"));
        let _guard = lock.lock().await;
        let mut inner = self.inner.lock().await;
        inner.aggregates.insert((kind, id.to_string()), body);
        Ok(())
    }

    async fn get_aggregate(
        &self,
        kind: AggregateKind,
        id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner.aggregates.get(&(kind, id.to_string())).cloned())
    }

    async fn delete_aggregate(&self, kind: AggregateKind, id: &str) -> Result<bool> {
        let lock = self.aggregate_locks.lock_for(&format!("{kind}:{id}"));
        let _guard = lock.lock().await;
        let mut inner = self.inner.lock().await;
        Ok(inner.aggregates.remove(&(kind, id.to_string())).is_some())
    }

    async fn list_aggregates(
        &self,
        kind: AggregateKind,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<(String, serde_json::Value)> = inner
            .aggregates
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, id), body)| (id.clone(), body.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::Utc;

    fn event(message_id: &str) -> NewEvent {
        NewEvent {
            message_id: message_id.to_string(),
            message_type: "channel.message.received".to_string(),
            ts: Utc::now(),
            payload: serde_json::json!({"message_id": message_id}),
        }
    }

    #[tokio::test]
    async fn appends_are_ordered_per_channel() {
        let backend = MemoryBackend::new();
        let p1 = backend.append_event("general", event("m-1")).await.unwrap();
        let p2 = backend.append_event("general", event("m-2")).await.unwrap();
        let other = backend.append_event("random", event("m-3")).await.unwrap();

        assert_eq!(p1, 1);
        assert_eq!(p2, 2);
        assert_eq!(other, 1);

        let records = backend.scan_events("general", 1, None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message_id, "m-1");
        assert_eq!(records[1].message_id, "m-2");
    }

    #[tokio::test]
    async fn duplicate_message_id_fails_across_channels() {
        let backend = MemoryBackend::new();
        backend.append_event("general", event("m-1")).await.unwrap();
        let error = backend
            .append_event("random", event("m-1"))
            .await
            .expect_err("duplicate append must fail");
        match error {
            Error::Store(StoreError::DuplicateMessageId { message_id }) => {
                assert_eq!(message_id, "m-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn replace_keeps_later_positions() {
        let backend = MemoryBackend::new();
        for n in 1..=5 {
            backend
                .append_event("general", event(&format!("m-{n}")))
                .await
                .unwrap();
        }

        let position = backend
            .replace_events("general", 1, 3, event("summary-1"))
            .await
            .unwrap();
        assert_eq!(position, 1);

        let records = backend.scan_events("general", 1, None).await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["summary-1", "m-4", "m-5"]);
        assert_eq!(records[1].position, 4);
    }

    #[tokio::test]
    async fn aggregates_round_trip() {
        let backend = MemoryBackend::new();
        backend
            .put_aggregate(
                AggregateKind::Agents,
                "overlord",
                serde_json::json!({"id": "overlord"}),
            )
            .await
            .unwrap();

        let body = backend
            .get_aggregate(AggregateKind::Agents, "overlord")
            .await
            .unwrap()
            .expect("aggregate should exist");
        assert_eq!(body["id"], "overlord");

        assert!(backend
            .delete_aggregate(AggregateKind::Agents, "overlord")
            .await
            .unwrap());
        assert!(!backend
            .delete_aggregate(AggregateKind::Agents, "overlord")
            .await
            .unwrap());
    }
}
