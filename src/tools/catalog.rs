//! Built-in tool catalog.
//!
//! Authorization answers `tool_unknown` from this list; the catalog routes
//! invocations to the guarded implementations.

use super::policy::Guardrails;
use crate::error::{PolicyError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A catalog entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub id: &'static str,
    pub description: &'static str,
}

/// Everything the runtime can hand to a worker or session.
pub const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        id: "exec.run",
        description: "Run a command inside the allowed exec roots",
    },
    ToolSpec {
        id: "fs.read",
        description: "Read a file, capped at the output byte limit",
    },
    ToolSpec {
        id: "fs.write",
        description: "Write a file inside the allowed write roots",
    },
    ToolSpec {
        id: "web.fetch",
        description: "Fetch a URL subject to the web guardrails",
    },
    ToolSpec {
        id: "agents.list",
        description: "List the runtime's agents",
    },
    ToolSpec {
        id: "tasks.update",
        description: "Update a project task",
    },
    ToolSpec {
        id: "channels.post",
        description: "Post a message to another channel",
    },
];

/// Whether a tool id exists in the catalog.
pub fn is_known(tool_id: &str) -> bool {
    TOOLS.iter().any(|tool| tool.id == tool_id)
}

/// Structured arguments for one invocation.
#[derive(Debug, Clone)]
pub enum ToolArgs {
    Exec { command: String },
    ReadFile { path: PathBuf },
    WriteFile { path: PathBuf, contents: Vec<u8> },
    Fetch { url: String },
}

/// Routes invocations to the guarded implementations, tracking the process
/// cap across concurrent execs.
pub struct ToolCatalog {
    exec: super::exec::ExecTool,
    web: super::web::WebTool,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            exec: super::exec::ExecTool::new(),
            web: super::web::WebTool::new(),
        }
    }

    /// Invoke a tool under `guardrails`. The caller has already authorized
    /// the (agent, tool) pair; this layer enforces the numeric caps.
    pub async fn invoke(
        &self,
        tool_id: &str,
        args: ToolArgs,
        guardrails: &Arc<Guardrails>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match (tool_id, args) {
            ("exec.run", ToolArgs::Exec { command }) => {
                self.exec.run(&command, guardrails, cancel).await
            }
            ("fs.read", ToolArgs::ReadFile { path }) => {
                super::file::read_file(&path, guardrails).await
            }
            ("fs.write", ToolArgs::WriteFile { path, contents }) => {
                super::file::write_file(&path, &contents, guardrails).await?;
                Ok(format!("wrote {} bytes", path.display()))
            }
            ("web.fetch", ToolArgs::Fetch { url }) => self.web.fetch(&url, guardrails).await,
            (tool_id, _) => Err(PolicyError::ToolUnknown {
                tool_id: tool_id.to_string(),
            }
            .into()),
        }
    }
}
