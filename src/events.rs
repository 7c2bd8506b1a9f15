//! Typed event envelopes and the per-channel append-only log.

pub mod envelope;
pub mod store;

pub use envelope::{
    BranchConclusionPayload, CompactionLevel, EventEnvelope, MessageBody, TokenUsage,
    PROTOCOL_VERSION,
};
pub use store::{ChannelSnapshot, EventStore, SnapshotMessage, StoredEnvelope};
