//! Compactor: watches channel utilization and rewrites history.
//!
//! Thresholds: > 0.80 schedules a soft summarization job, > 0.85 doubles the
//! target reduction, > 0.95 additionally quarantines the channel until
//! utilization falls back to the release level. Exactly one job per channel
//! runs at a time; further crossings while one is in flight are coalesced
//! into a single follow-up run.

use crate::config::ConfigHandle;
use crate::error::Result;
use crate::events::envelope::{CompactionLevel, EventEnvelope, MessageBody};
use crate::events::EventStore;
use crate::llm::{ChatMessage, LlmManager};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct ChannelState {
    in_flight: bool,
    /// A crossing observed while a job was running; drained when it ends.
    pending: Option<CompactionLevel>,
    quarantined: bool,
}

/// Per-channel compaction driver.
pub struct Compactor {
    store: Arc<EventStore>,
    llm: Arc<LlmManager>,
    config: Arc<ConfigHandle>,
    channels: Mutex<HashMap<String, ChannelState>>,
}

impl Compactor {
    pub fn new(store: Arc<EventStore>, llm: Arc<LlmManager>, config: Arc<ConfigHandle>) -> Self {
        Self {
            store,
            llm,
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn level_for(utilization: f64, config: &crate::config::CompactionConfig) -> Option<CompactionLevel> {
        if utilization > config.emergency_threshold {
            Some(CompactionLevel::Emergency)
        } else if utilization > config.aggressive_threshold {
            Some(CompactionLevel::Aggressive)
        } else if utilization > config.soft_threshold {
            Some(CompactionLevel::Soft)
        } else {
            None
        }
    }

    /// Whether the channel accepts new messages. Quarantined channels are
    /// re-checked against the release level so recovery is observable without
    /// another append.
    pub async fn is_quarantined(&self, channel_id: &str) -> bool {
        let quarantined = {
            let channels = self.channels.lock().await;
            channels
                .get(channel_id)
                .map(|state| state.quarantined)
                .unwrap_or(false)
        };
        if !quarantined {
            return false;
        }

        let release = self.config.load().compaction.quarantine_release;
        let utilization = match self.store.snapshot(channel_id).await {
            Ok(snapshot) => snapshot.context_utilization,
            Err(_) => return true,
        };
        if utilization <= release {
            let mut channels = self.channels.lock().await;
            if let Some(state) = channels.get_mut(channel_id) {
                state.quarantined = false;
            }
            tracing::info!(channel_id, utilization, "channel quarantine released");
            false
        } else {
            true
        }
    }

    /// Observe the channel after an append; schedule work if a threshold was
    /// crossed. Called by the dispatcher off the hot path.
    pub async fn observe(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let config = self.config.load().compaction;
        let snapshot = self.store.snapshot(channel_id).await?;
        let utilization = snapshot.context_utilization;

        let Some(level) = Self::level_for(utilization, &config) else {
            return Ok(());
        };

        {
            let mut channels = self.channels.lock().await;
            let state = channels.entry(channel_id.to_string()).or_default();

            if level == CompactionLevel::Emergency && !state.quarantined {
                state.quarantined = true;
                tracing::warn!(channel_id, utilization, "channel quarantined");
            }

            if state.in_flight {
                // Coalesce: keep the most severe pending level.
                state.pending = Some(match state.pending {
                    Some(existing) if severity(existing) >= severity(level) => existing,
                    _ => level,
                });
                return Ok(());
            }
            state.in_flight = true;
        }

        self.store
            .append(EventEnvelope::new(
                channel_id,
                uuid::Uuid::new_v4().to_string(),
                MessageBody::CompactorThresholdHit {
                    utilization,
                    level,
                    extra: serde_json::Map::new(),
                },
            ))
            .await?;

        let compactor = Arc::clone(self);
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            compactor.run_jobs(channel_id, level).await;
        });
        Ok(())
    }

    /// Run the scheduled job, then any coalesced follow-up, then clear the
    /// in-flight flag.
    async fn run_jobs(self: Arc<Self>, channel_id: String, mut level: CompactionLevel) {
        loop {
            if let Err(error) = self.compact_once(&channel_id, level).await {
                tracing::warn!(channel_id = %channel_id, %error, "compaction job failed");
            }

            let mut channels = self.channels.lock().await;
            let state = channels.entry(channel_id.clone()).or_default();
            match state.pending.take() {
                Some(next) => level = next,
                None => {
                    state.in_flight = false;
                    // Release the quarantine if the rewrite brought us under.
                    drop(channels);
                    let _ = self.is_quarantined(&channel_id).await;
                    return;
                }
            }
        }
    }

    /// One summarization pass: pick the oldest contiguous run whose removal
    /// brings utilization to the target, digest it, and replace it with a
    /// single summary envelope.
    async fn compact_once(&self, channel_id: &str, level: CompactionLevel) -> Result<()> {
        let config = self.config.load();
        let budget = config.channel.context_window_tokens.max(1) as f64;
        let compaction = config.compaction;

        let weights = self.store.message_weights(channel_id).await?;
        if weights.len() < 2 {
            return Ok(());
        }
        let total_tokens: u64 = weights.iter().map(|(_, tokens, _)| tokens).sum();
        let utilization = total_tokens as f64 / budget;

        let target = match level {
            CompactionLevel::Soft => compaction.target_utilization,
            // Double the reduction relative to the soft target.
            CompactionLevel::Aggressive | CompactionLevel::Emergency => {
                (2.0 * compaction.target_utilization - utilization).max(0.2)
            }
        };
        if utilization <= target {
            return Ok(());
        }

        let must_remove = ((utilization - target) * budget).ceil() as u64;
        let mut removed_tokens = 0u64;
        let mut run_end_index = 0usize;
        // Keep at least the newest message out of the run.
        for (index, (_, tokens, _)) in weights.iter().enumerate() {
            if index + 1 >= weights.len() {
                break;
            }
            removed_tokens += tokens;
            run_end_index = index;
            if removed_tokens >= must_remove {
                break;
            }
        }

        let first = weights[0].0;
        let last = weights[run_end_index].0;
        let superseded: Vec<String> = weights[..=run_end_index]
            .iter()
            .map(|(_, _, message_id)| message_id.clone())
            .collect();

        let digest = self.digest(channel_id, first, last).await?;

        let summary = EventEnvelope::new(
            channel_id,
            uuid::Uuid::new_v4().to_string(),
            MessageBody::CompactorSummaryApplied {
                digest,
                superseded_message_ids: superseded,
                extra: serde_json::Map::new(),
            },
        );
        self.store
            .replace_run(channel_id, first, last, summary)
            .await?;

        tracing::info!(
            channel_id,
            level = %level,
            first,
            last,
            "compaction summary applied"
        );
        Ok(())
    }

    /// Digest the run `[first, last]`: provider-written when a model is
    /// configured, mechanical first-lines otherwise.
    async fn digest(&self, channel_id: &str, first: u64, last: u64) -> Result<String> {
        let stored = self.store.read(channel_id, first).await?;
        let mut lines = Vec::new();
        for item in stored.iter().filter(|item| item.position <= last) {
            let content = match &item.envelope.body {
                MessageBody::ChannelMessageReceived { user_id, content, .. } => {
                    Some(format!("{user_id}: {content}"))
                }
                MessageBody::ChannelReplySent { content, .. } => Some(format!("reply: {content}")),
                MessageBody::BranchConclusion(conclusion) => {
                    Some(format!("branch: {}", conclusion.summary))
                }
                MessageBody::WorkerCompleted { report, .. } => Some(format!("worker: {report}")),
                MessageBody::CompactorSummaryApplied { digest, .. } => Some(digest.clone()),
                _ => None,
            };
            if let Some(line) = content {
                let first_line = line.lines().next().unwrap_or("").to_string();
                lines.push(first_line);
            }
        }
        let transcript = lines.join("\n");

        if self.llm.configured() {
            let messages = vec![
                ChatMessage::system(
                    "Summarize the following channel history into a short digest. \
                     Keep decisions, names, and open threads.",
                ),
                ChatMessage::user(transcript.clone()),
            ];
            match self.llm.complete(messages, 512).await {
                Ok(completion) => return Ok(completion.content),
                Err(error) => {
                    tracing::warn!(channel_id, %error, "provider digest failed, using mechanical digest");
                }
            }
        }

        let mut digest = format!("[compacted history]\n{transcript}");
        const MAX_DIGEST_CHARS: usize = 400;
        if digest.chars().count() > MAX_DIGEST_CHARS {
            digest = digest.chars().take(MAX_DIGEST_CHARS).collect();
        }
        Ok(digest)
    }
}

fn severity(level: CompactionLevel) -> u8 {
    match level {
        CompactionLevel::Soft => 0,
        CompactionLevel::Aggressive => 1,
        CompactionLevel::Emergency => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::persist::MemoryBackend;

    fn fixture() -> (Arc<Compactor>, Arc<EventStore>) {
        let mut config = RuntimeConfig::default();
        // A tiny budget so a handful of messages crosses the thresholds.
        config.channel.context_window_tokens = 256;
        let config = ConfigHandle::new(config);
        let store = Arc::new(EventStore::new(MemoryBackend::new(), config.clone()));
        let llm = Arc::new(LlmManager::new(config.clone()));
        (Arc::new(Compactor::new(store.clone(), llm, config)), store)
    }

    async fn flood(store: &EventStore, channel: &str, messages: usize, chars: usize) {
        for n in 0..messages {
            store
                .append(EventEnvelope::new(
                    channel,
                    uuid::Uuid::new_v4().to_string(),
                    MessageBody::ChannelMessageReceived {
                        user_id: "u1".into(),
                        content: format!("{n} {}", "x".repeat(chars)),
                        extra: serde_json::Map::new(),
                    },
                ))
                .await
                .expect("append");
        }
    }

    #[test]
    fn levels_match_the_threshold_table() {
        let config = crate::config::CompactionConfig::default();
        assert_eq!(Compactor::level_for(0.80, &config), None);
        assert_eq!(
            Compactor::level_for(0.801, &config),
            Some(CompactionLevel::Soft)
        );
        assert_eq!(Compactor::level_for(0.85, &config), Some(CompactionLevel::Soft));
        assert_eq!(
            Compactor::level_for(0.851, &config),
            Some(CompactionLevel::Aggressive)
        );
        assert_eq!(
            Compactor::level_for(0.95, &config),
            Some(CompactionLevel::Aggressive)
        );
        assert_eq!(
            Compactor::level_for(0.951, &config),
            Some(CompactionLevel::Emergency)
        );
    }

    #[tokio::test]
    async fn soft_crossing_rewrites_history_with_a_summary() {
        let (compactor, store) = fixture();
        flood(&store, "general", 12, 60).await;

        let before = store.snapshot("general").await.unwrap();
        assert!(before.context_utilization > 0.80);

        compactor.observe("general").await.expect("observe");
        // The job runs on a spawned task; give it a few polls.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let stored = store.read("general", 1).await.unwrap();
            if stored
                .iter()
                .any(|item| item.envelope.message_type() == "compactor.summary.applied")
            {
                break;
            }
        }

        let stored = store.read("general", 1).await.unwrap();
        let summary = stored
            .iter()
            .find(|item| item.envelope.message_type() == "compactor.summary.applied")
            .expect("summary envelope applied");
        match &summary.envelope.body {
            MessageBody::CompactorSummaryApplied {
                superseded_message_ids,
                ..
            } => assert!(!superseded_message_ids.is_empty()),
            other => panic!("unexpected body: {other:?}"),
        }

        let after = store.snapshot("general").await.unwrap();
        assert!(after.context_utilization < before.context_utilization);
    }

    #[tokio::test]
    async fn emergency_quarantines_until_release() {
        let (compactor, store) = fixture();
        flood(&store, "general", 24, 80).await;
        let snapshot = store.snapshot("general").await.unwrap();
        assert!(snapshot.context_utilization > 0.95);

        compactor.observe("general").await.expect("observe");
        // Quarantine takes effect immediately on observation.
        {
            let channels = compactor.channels.lock().await;
            assert!(channels.get("general").is_some_and(|s| s.quarantined));
        }

        // After compaction drains utilization, the quarantine releases.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if !compactor.is_quarantined("general").await {
                return;
            }
        }
        panic!("quarantine never released");
    }

    #[tokio::test]
    async fn below_threshold_is_a_no_op() {
        let (compactor, store) = fixture();
        flood(&store, "general", 2, 10).await;
        compactor.observe("general").await.expect("observe");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stored = store.read("general", 1).await.unwrap();
        assert!(stored
            .iter()
            .all(|item| item.envelope.message_type() == "channel.message.received"));
    }
}
