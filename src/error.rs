//! Top-level error types for the orchestration runtime.
//!
//! Every error that can surface in an HTTP response or an event envelope maps
//! to a machine-grepable [`ErrorKind`]. Domain errors stay in their own enums
//! and are wrapped transparently, mirroring how subsystems are layered.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-grepable error kinds surfaced in responses and envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedRequest,
    Unauthorized,
    NotFound,
    Duplicate,
    RateLimited,
    Conflict,
    Internal,
    ToolForbidden,
    ToolUnknown,
    ToolTimeout,
    ToolOutputTooLarge,
    PolicyMissing,
    ProcessLimitExceeded,
    PathOutsideAllowedRoots,
    DeniedCommandPrefix,
    ChannelOverloaded,
    WorkerCancelled,
    WorkerTimeout,
    ProviderUnavailable,
    DuplicateMessageId,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "malformed_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
            ErrorKind::ToolForbidden => "tool_forbidden",
            ErrorKind::ToolUnknown => "tool_unknown",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolOutputTooLarge => "tool_output_too_large",
            ErrorKind::PolicyMissing => "policy_missing",
            ErrorKind::ProcessLimitExceeded => "process_limit_exceeded",
            ErrorKind::PathOutsideAllowedRoots => "path_outside_allowed_roots",
            ErrorKind::DeniedCommandPrefix => "denied_command_prefix",
            ErrorKind::ChannelOverloaded => "channel_overloaded",
            ErrorKind::WorkerCancelled => "worker_cancelled",
            ErrorKind::WorkerTimeout => "worker_timeout",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::DuplicateMessageId => "duplicate_message_id",
        }
    }

    /// HTTP status code for API responses.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::MalformedRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Duplicate | ErrorKind::Conflict | ErrorKind::DuplicateMessageId => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::ChannelOverloaded => 429,
            ErrorKind::ToolForbidden
            | ErrorKind::ToolUnknown
            | ErrorKind::PolicyMissing
            | ErrorKind::PathOutsideAllowedRoots
            | ErrorKind::DeniedCommandPrefix => 403,
            ErrorKind::ToolTimeout | ErrorKind::WorkerTimeout => 504,
            ErrorKind::ProviderUnavailable => 502,
            ErrorKind::Internal
            | ErrorKind::ToolOutputTooLarge
            | ErrorKind::ProcessLimitExceeded
            | ErrorKind::WorkerCancelled => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The machine-grepable kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Internal,
            Error::Store(error) => error.kind(),
            Error::Policy(error) => error.kind(),
            Error::Agent(error) => error.kind(),
            Error::Session(error) => error.kind(),
            Error::Provider(error) => error.kind(),
            Error::Sqlx(_) | Error::Io(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Event store and persistence adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate message id: {message_id}")]
    DuplicateMessageId { message_id: String },

    #[error("aggregate not found: {kind}/{id}")]
    AggregateNotFound { kind: &'static str, id: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::DuplicateMessageId { .. } => ErrorKind::DuplicateMessageId,
            StoreError::AggregateNotFound { .. } => ErrorKind::NotFound,
            StoreError::Query(_) | StoreError::Database(_) | StoreError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Tool authorization and guardrail errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("tool forbidden by policy: {tool_id}")]
    ToolForbidden { tool_id: String },

    #[error("unknown tool: {tool_id}")]
    ToolUnknown { tool_id: String },

    #[error("policy file missing for agent {agent_id}")]
    PolicyMissing { agent_id: String },

    #[error("tool timed out after {seconds}s")]
    ToolTimeout { seconds: u64 },

    #[error("tool output exceeded {max_bytes} bytes")]
    OutputTooLarge { max_bytes: u64 },

    #[error("process limit ({max}) exceeded")]
    ProcessLimitExceeded { max: u32 },

    #[error("path outside allowed roots: {path}")]
    PathOutsideAllowedRoots { path: String },

    #[error("command prefix denied: {prefix}")]
    DeniedCommandPrefix { prefix: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PolicyError::ToolForbidden { .. } => ErrorKind::ToolForbidden,
            PolicyError::ToolUnknown { .. } => ErrorKind::ToolUnknown,
            PolicyError::PolicyMissing { .. } => ErrorKind::PolicyMissing,
            PolicyError::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            PolicyError::OutputTooLarge { .. } => ErrorKind::ToolOutputTooLarge,
            PolicyError::ProcessLimitExceeded { .. } => ErrorKind::ProcessLimitExceeded,
            PolicyError::PathOutsideAllowedRoots { .. } => ErrorKind::PathOutsideAllowedRoots,
            PolicyError::DeniedCommandPrefix { .. } => ErrorKind::DeniedCommandPrefix,
            PolicyError::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Channel, branch, worker, and dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("channel {id} not found")]
    ChannelNotFound { id: String },

    #[error("worker {id} not found")]
    WorkerNotFound { id: String },

    #[error("channel {id} overloaded, rejecting new messages")]
    ChannelOverloaded { id: String },

    #[error("worker state transition failed: {0}")]
    InvalidStateTransition(String),

    #[error("worker cancelled: {reason}")]
    WorkerCancelled { reason: String },

    #[error("worker timed out after {seconds}s")]
    WorkerTimeout { seconds: u64 },

    #[error("rate limit exceeded for agent {agent_id}")]
    RateLimited { agent_id: String },

    #[error("message rejected by channel plugin: {reason}")]
    PluginRejected { reason: String },

    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ChannelNotFound { .. } | AgentError::WorkerNotFound { .. } => {
                ErrorKind::NotFound
            }
            AgentError::ChannelOverloaded { .. } => ErrorKind::ChannelOverloaded,
            AgentError::InvalidStateTransition(_) => ErrorKind::Conflict,
            AgentError::WorkerCancelled { .. } => ErrorKind::WorkerCancelled,
            AgentError::WorkerTimeout { .. } => ErrorKind::WorkerTimeout,
            AgentError::RateLimited { .. } => ErrorKind::RateLimited,
            AgentError::PluginRejected { .. } => ErrorKind::Unauthorized,
            AgentError::CompactionFailed(_) | AgentError::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Agent session engine errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("agent {id} not found")]
    AgentNotFound { id: String },

    #[error("agent {id} already exists")]
    AgentExists { id: String },

    #[error("session {id} not found")]
    SessionNotFound { id: String },

    #[error("invalid session request: {0}")]
    Invalid(String),

    #[error("session log write failed: {0}")]
    LogWrite(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::AgentNotFound { .. } | SessionError::SessionNotFound { .. } => {
                ErrorKind::NotFound
            }
            SessionError::AgentExists { .. } => ErrorKind::Duplicate,
            SessionError::Invalid(_) => ErrorKind::MalformedRequest,
            SessionError::LogWrite(_) | SessionError::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Model provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no model provider configured")]
    Unconfigured,

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Unconfigured
            | ProviderError::Request(_)
            | ProviderError::Timeout { .. } => ErrorKind::ProviderUnavailable,
            ProviderError::Other(_) => ErrorKind::Internal,
        }
    }
}
