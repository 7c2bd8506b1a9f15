//! Agent sessions: append-only per-session logs, message ingest, and
//! SSE-style streaming fan-out.

pub mod engine;
pub mod log;
pub mod stream;

pub use engine::{AgentSessionSummary, AttachmentUpload, SessionEngine};
pub use log::{AgentSessionEvent, Attachment, RunControlAction, RunState, SessionEventBody};
pub use stream::{StreamKind, StreamUpdate};
