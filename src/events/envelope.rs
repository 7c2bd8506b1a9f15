//! The persistent event envelope: a tagged record with causal metadata.
//!
//! Envelopes are immutable after append and ordered per channel by append
//! index. Payloads are schema-per-variant; unknown payload fields and
//! `extensions` keys round-trip verbatim so newer writers never lose data
//! through older readers.

use crate::agent::router::RouteDecision;
use crate::{BranchId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope schema version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Prompt/completion token accounting for a branch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
}

/// Compaction escalation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionLevel {
    Soft,
    Aggressive,
    Emergency,
}

impl CompactionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CompactionLevel::Soft => "soft",
            CompactionLevel::Aggressive => "aggressive",
            CompactionLevel::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for CompactionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a branch: only this survives the branch context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchConclusionPayload {
    pub summary: String,
    #[serde(default)]
    pub artifact_refs: Vec<String>,
    #[serde(default)]
    pub memory_refs: Vec<String>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Message type + payload, adjacently tagged so the wire form carries
/// `messageType` and `payload` as sibling fields of the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "payload")]
pub enum MessageBody {
    #[serde(rename = "channel.message.received")]
    ChannelMessageReceived {
        #[serde(rename = "userId")]
        user_id: String,
        content: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "channel.route.decided")]
    ChannelRouteDecided {
        #[serde(flatten)]
        decision: RouteDecision,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    /// Outbound inline reply, recorded so the snapshot's message view is
    /// fully log-derived.
    #[serde(rename = "channel.reply.sent")]
    ChannelReplySent {
        content: String,
        #[serde(rename = "viaProvider")]
        via_provider: bool,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "branch.spawned")]
    BranchSpawned {
        description: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "branch.conclusion")]
    BranchConclusion(BranchConclusionPayload),

    #[serde(rename = "worker.spawned")]
    WorkerSpawned {
        title: String,
        objective: String,
        mode: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "worker.progress")]
    WorkerProgress {
        report: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "worker.completed")]
    WorkerCompleted {
        report: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "worker.failed")]
    WorkerFailed {
        reason: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "compactor.threshold.hit")]
    CompactorThresholdHit {
        utilization: f64,
        level: CompactionLevel,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "compactor.summary.applied")]
    CompactorSummaryApplied {
        digest: String,
        #[serde(rename = "supersededMessageIds")]
        superseded_message_ids: Vec<String>,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "visor.bulletin.generated")]
    VisorBulletinGenerated {
        bulletin: String,
        #[serde(rename = "taskIds", default)]
        task_ids: Vec<String>,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "actor.discussion.started")]
    ActorDiscussionStarted {
        participants: Vec<String>,
        topic: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "actor.discussion.concluded")]
    ActorDiscussionConcluded {
        participants: Vec<String>,
        outcome: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
}

impl MessageBody {
    /// The wire tag, used for log indexing.
    pub fn message_type(&self) -> &'static str {
        match self {
            MessageBody::ChannelMessageReceived { .. } => "channel.message.received",
            MessageBody::ChannelRouteDecided { .. } => "channel.route.decided",
            MessageBody::ChannelReplySent { .. } => "channel.reply.sent",
            MessageBody::BranchSpawned { .. } => "branch.spawned",
            MessageBody::BranchConclusion(_) => "branch.conclusion",
            MessageBody::WorkerSpawned { .. } => "worker.spawned",
            MessageBody::WorkerProgress { .. } => "worker.progress",
            MessageBody::WorkerCompleted { .. } => "worker.completed",
            MessageBody::WorkerFailed { .. } => "worker.failed",
            MessageBody::CompactorThresholdHit { .. } => "compactor.threshold.hit",
            MessageBody::CompactorSummaryApplied { .. } => "compactor.summary.applied",
            MessageBody::VisorBulletinGenerated { .. } => "visor.bulletin.generated",
            MessageBody::ActorDiscussionStarted { .. } => "actor.discussion.started",
            MessageBody::ActorDiscussionConcluded { .. } => "actor.discussion.concluded",
        }
    }
}

/// A tagged event record with causal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub protocol_version: u32,
    pub message_id: String,
    pub ts: DateTime<Utc>,
    pub trace_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<BranchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(flatten)]
    pub body: MessageBody,
    /// Unknown extension keys are preserved on read.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    /// New envelope with a fresh message id and the current timestamp.
    pub fn new(channel_id: impl Into<String>, trace_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message_id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            trace_id: trace_id.into(),
            channel_id: channel_id.into(),
            task_id: None,
            branch_id: None,
            worker_id: None,
            body,
            extensions: serde_json::Map::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn message_type(&self) -> &'static str {
        self.body.message_type()
    }

    /// Serialize to the stored JSON form.
    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Null)
    }

    /// Decode from the stored JSON form.
    pub fn decode(value: &serde_json::Value) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
