//! Session event types and the JSONL file that stores them.

use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Attachment metadata; inline content is absent above the configured cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Thinking,
    Searching,
    Responding,
    Done,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunControlAction {
    Pause,
    Resume,
    Interrupt,
}

/// Session event bodies, tagged by `type` with a schema-per-type payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEventBody {
    SessionCreated {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_session_id: Option<String>,
    },
    Message {
        role: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    RunStatus {
        state: RunState,
    },
    SubSession {
        child_session_id: String,
    },
    RunControl {
        action: RunControlAction,
        requested_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ToolCall {
        tool_id: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool_id: String,
        output: serde_json::Value,
    },
}

/// One appended session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionEvent {
    pub id: String,
    pub session_id: String,
    /// Append index within the session, starting at 1.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub body: SessionEventBody,
}

/// One session's on-disk log: one JSON object per line.
pub struct SessionLogFile {
    path: PathBuf,
}

impl SessionLogFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn append(&self, event: &AgentSessionEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| SessionError::LogWrite(error.to_string()))?;
        }
        let line = serde_json::to_string(event)
            .map_err(|error| SessionError::LogWrite(error.to_string()))?;

        use tokio::io::AsyncWriteExt as _;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|error| SessionError::LogWrite(error.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|error| SessionError::LogWrite(error.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|error| SessionError::LogWrite(error.to_string()))?;
        Ok(())
    }

    /// All events, in append order. Unparseable lines are skipped with a
    /// warning rather than poisoning the session.
    pub async fn read_all(&self) -> Result<Vec<AgentSessionEvent>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(error) => return Err(error.into()),
        };

        let mut events = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AgentSessionEvent>(line) {
                Ok(event) => events.push(event),
                Err(error) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        %error,
                        "skipping bad session log line"
                    );
                }
            }
        }
        Ok(events)
    }

    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
