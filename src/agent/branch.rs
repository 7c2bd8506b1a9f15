//! Branch runtime: ephemeral multi-step reasoning contexts.
//!
//! A branch gets the channel's compacted history and the routed prompt, runs
//! to a conclusion, and vanishes. Only `branch.spawned` and
//! `branch.conclusion` reach the channel log; anything bulky the branch
//! produces is stored as a content-addressed artifact and referenced.

use crate::artifacts::ArtifactStore;
use crate::error::Result;
use crate::events::envelope::{BranchConclusionPayload, EventEnvelope, MessageBody, TokenUsage};
use crate::events::EventStore;
use crate::llm::{ChatMessage, LlmManager};
use crate::BranchId;
use std::path::Path;
use std::sync::Arc;

/// A conclusion above this size is stored as an artifact and truncated in
/// the envelope.
const INLINE_CONCLUSION_CHARS: usize = 2048;

pub struct BranchRuntime {
    store: Arc<EventStore>,
    llm: Arc<LlmManager>,
    artifacts: Arc<ArtifactStore>,
}

impl BranchRuntime {
    pub fn new(store: Arc<EventStore>, llm: Arc<LlmManager>, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            llm,
            artifacts,
        }
    }

    /// Run a branch for `prompt` on `channel_id` and append its conclusion.
    /// Returns the branch id.
    pub async fn run(
        &self,
        channel_id: &str,
        trace_id: &str,
        prompt: &str,
        token_budget: u32,
    ) -> Result<BranchId> {
        let branch_id: BranchId = uuid::Uuid::new_v4();

        self.store
            .append(
                EventEnvelope::new(
                    channel_id,
                    trace_id,
                    MessageBody::BranchSpawned {
                        description: prompt.to_string(),
                        extra: serde_json::Map::new(),
                    },
                )
                .with_branch(branch_id),
            )
            .await?;

        let (summary, token_usage) = self.conclude(channel_id, prompt, token_budget).await;

        let mut payload = BranchConclusionPayload {
            summary,
            artifact_refs: Vec::new(),
            memory_refs: Vec::new(),
            token_usage,
            extra: serde_json::Map::new(),
        };

        if payload.summary.chars().count() > INLINE_CONCLUSION_CHARS {
            let record = self
                .artifacts
                .store(
                    Path::new("artifacts"),
                    &format!("branch-{branch_id}.md"),
                    payload.summary.as_bytes(),
                )
                .await?;
            let truncated: String = payload
                .summary
                .chars()
                .take(INLINE_CONCLUSION_CHARS)
                .collect();
            payload.summary = format!("{truncated}…");
            payload.artifact_refs.push(record.id);
        }

        self.store
            .append(
                EventEnvelope::new(channel_id, trace_id, MessageBody::BranchConclusion(payload))
                    .with_branch(branch_id),
            )
            .await?;

        tracing::info!(channel_id, branch_id = %branch_id, "branch concluded");
        Ok(branch_id)
    }

    /// Produce the conclusion: provider-backed when configured, a mechanical
    /// synthesis of the compacted history otherwise.
    async fn conclude(
        &self,
        channel_id: &str,
        prompt: &str,
        token_budget: u32,
    ) -> (String, TokenUsage) {
        let history = match self.store.snapshot(channel_id).await {
            Ok(snapshot) => snapshot.messages,
            Err(_) => Vec::new(),
        };

        if self.llm.configured() {
            let mut messages = vec![ChatMessage::system(
                "You are an ephemeral reasoning branch. Work through the request \
                 step by step and reply with a conclusion only.",
            )];
            for message in history.iter().rev().take(20).rev() {
                match message.role.as_str() {
                    "user" => messages.push(ChatMessage::user(message.content.clone())),
                    _ => messages.push(ChatMessage::assistant(message.content.clone())),
                }
            }
            messages.push(ChatMessage::user(prompt.to_string()));

            match self.llm.complete(messages, token_budget).await {
                Ok(completion) => {
                    return (
                        completion.content,
                        TokenUsage {
                            prompt: completion.prompt_tokens,
                            completion: completion.completion_tokens,
                        },
                    );
                }
                Err(error) => {
                    tracing::warn!(channel_id, %error, "branch provider call failed, concluding mechanically");
                }
            }
        }

        let context_lines = history.len();
        let summary = format!(
            "Considered {context_lines} prior message(s); conclusion for: {}",
            prompt.lines().next().unwrap_or(prompt)
        );
        let prompt_tokens = (prompt.chars().count() as u64).div_ceil(4);
        (
            summary,
            TokenUsage {
                prompt: prompt_tokens,
                completion: 16,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, RuntimeConfig};
    use crate::persist::MemoryBackend;

    fn runtime(dir: &std::path::Path) -> (BranchRuntime, Arc<EventStore>) {
        let mut config = RuntimeConfig::default();
        config.workspace_root = dir.to_path_buf();
        let config = ConfigHandle::new(config);
        let backend = MemoryBackend::new();
        let store = Arc::new(EventStore::new(backend.clone(), config.clone()));
        let llm = Arc::new(LlmManager::new(config.clone()));
        let artifacts = Arc::new(ArtifactStore::new(dir.to_path_buf(), backend));
        (
            BranchRuntime::new(store.clone(), llm, artifacts),
            store,
        )
    }

    #[tokio::test]
    async fn branch_appends_exactly_spawned_and_conclusion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (runtime, store) = runtime(dir.path());

        let branch_id = runtime
            .run("general", "trace-1", "compare the options", 1200)
            .await
            .expect("branch runs");

        let stored = store.read("general", 1).await.unwrap();
        let types: Vec<&str> = stored
            .iter()
            .map(|item| item.envelope.message_type())
            .collect();
        assert_eq!(types, vec!["branch.spawned", "branch.conclusion"]);
        assert!(stored
            .iter()
            .all(|item| item.envelope.branch_id == Some(branch_id)));
        assert_eq!(stored[0].envelope.trace_id, "trace-1");
    }

    #[tokio::test]
    async fn conclusion_carries_token_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (runtime, store) = runtime(dir.path());
        runtime
            .run("general", "trace-1", "plan the rollout", 1200)
            .await
            .expect("branch runs");

        let stored = store.read("general", 1).await.unwrap();
        match &stored[1].envelope.body {
            MessageBody::BranchConclusion(payload) => {
                assert!(payload.token_usage.prompt > 0);
                assert!(!payload.summary.is_empty());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
