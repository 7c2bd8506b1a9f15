//! Persistence adapter: uniform key/ordered-log operations.
//!
//! Two interchangeable backends are selected at startup: an embedded SQLite
//! engine ([`SqliteBackend`]) and a purely in-memory implementation
//! ([`MemoryBackend`]) that mirrors the same operations for tests. Everything
//! above this layer talks to the [`Backend`] trait; aggregates are stored as
//! JSON bodies and joined by id.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// The mutable aggregates, one table (or map) each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Agents,
    Sessions,
    Projects,
    Tasks,
    ActorBoard,
    Workers,
    Plugins,
    ToolsPolicy,
    Artifacts,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 9] = [
        AggregateKind::Agents,
        AggregateKind::Sessions,
        AggregateKind::Projects,
        AggregateKind::Tasks,
        AggregateKind::ActorBoard,
        AggregateKind::Workers,
        AggregateKind::Plugins,
        AggregateKind::ToolsPolicy,
        AggregateKind::Artifacts,
    ];

    pub fn table(self) -> &'static str {
        match self {
            AggregateKind::Agents => "agents",
            AggregateKind::Sessions => "sessions",
            AggregateKind::Projects => "projects",
            AggregateKind::Tasks => "tasks",
            AggregateKind::ActorBoard => "actor_board",
            AggregateKind::Workers => "workers",
            AggregateKind::Plugins => "plugins",
            AggregateKind::ToolsPolicy => "tools_policy",
            AggregateKind::Artifacts => "artifacts",
        }
    }
}

impl std::fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// A stored event row: the envelope JSON plus its indexing columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Append index within the channel, starting at 1.
    pub position: u64,
    pub message_id: String,
    pub message_type: String,
    pub ts: DateTime<Utc>,
    /// The full envelope as it was appended.
    pub payload: serde_json::Value,
}

/// An event to append; the backend allocates the position.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub message_id: String,
    pub message_type: String,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Uniform persistence operations over either backend.
///
/// Appends to one channel are totally ordered; `message_id` is unique across
/// the whole store (a duplicate append fails with `duplicate_message_id`).
/// Aggregate writes are serialized per aggregate id by the backend.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Append an event to a channel's log and return its position.
    async fn append_event(&self, channel_id: &str, event: NewEvent) -> Result<u64>;

    /// Ordered scan from `from_position` (inclusive), optionally limited.
    async fn scan_events(
        &self,
        channel_id: &str,
        from_position: u64,
        limit: Option<u32>,
    ) -> Result<Vec<EventRecord>>;

    /// Replace the contiguous run `[first, last]` with a single summary event
    /// that takes over position `first`. Used by the compactor; later
    /// positions are untouched so readers keep their order.
    async fn replace_events(
        &self,
        channel_id: &str,
        first: u64,
        last: u64,
        summary: NewEvent,
    ) -> Result<u64>;

    /// Channel ids that have at least one event.
    async fn list_channels(&self) -> Result<Vec<String>>;

    /// Upsert a single aggregate row.
    async fn put_aggregate(
        &self,
        kind: AggregateKind,
        id: &str,
        body: serde_json::Value,
    ) -> Result<()>;

    /// Read one aggregate row.
    async fn get_aggregate(&self, kind: AggregateKind, id: &str)
        -> Result<Option<serde_json::Value>>;

    /// Delete one aggregate row. Returns whether it existed.
    async fn delete_aggregate(&self, kind: AggregateKind, id: &str) -> Result<bool>;

    /// All rows of one aggregate kind, ordered by id.
    async fn list_aggregates(
        &self,
        kind: AggregateKind,
    ) -> Result<Vec<(String, serde_json::Value)>>;
}

/// Async locks keyed by string, for per-aggregate write serialization.
///
/// Lock handles are created on first use and kept for the process lifetime;
/// the key space (channels, aggregate ids) is small and bounded by usage.
#[derive(Default)]
pub struct KeyedLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `key`, shared across callers.
    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.lock_for("channel:general");
                let _guard = lock.lock().await;
                let seen = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::task::yield_now().await;
                // No other task may have incremented while we held the lock.
                assert_eq!(
                    counter.load(std::sync::atomic::Ordering::SeqCst),
                    seen + 1
                );
            }));
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }
    }

    #[test]
    fn distinct_keys_get_distinct_locks() {
        let locks = KeyedLocks::new();
        let a = locks.lock_for("a");
        let b = locks.lock_for("b");
        assert!(!Arc::ptr_eq(&a, &b));
        let a2 = locks.lock_for("a");
        assert!(Arc::ptr_eq(&a, &a2));
    }
}
