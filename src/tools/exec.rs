//! Guarded subprocess execution.

use super::policy::{check_command_prefix, check_path_in_roots, Guardrails};
use crate::error::{PolicyError, Result};
use anyhow::Context as _;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Releases a process slot on every exit path, including cancellation.
struct ProcessSlot {
    active: Arc<AtomicU32>,
}

impl ProcessSlot {
    fn acquire(active: &Arc<AtomicU32>, max: u32) -> Result<Self> {
        let previous = active.fetch_add(1, Ordering::SeqCst);
        if previous >= max {
            active.fetch_sub(1, Ordering::SeqCst);
            return Err(PolicyError::ProcessLimitExceeded { max }.into());
        }
        Ok(Self {
            active: active.clone(),
        })
    }
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs commands through `sh -c` under the agent's guardrails.
pub struct ExecTool {
    active: Arc<AtomicU32>,
}

impl Default for ExecTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecTool {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Execute `command`, returning combined stdout/stderr.
    ///
    /// Enforced here: denied prefixes, allowed exec roots (the command's
    /// program path), the exec timeout, the output byte cap, and the process
    /// cap. Cancellation kills the child.
    pub async fn run(
        &self,
        command: &str,
        guardrails: &Arc<Guardrails>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        check_command_prefix(command, guardrails)?;

        // The first token is the program; absolute programs must live inside
        // an allowed exec root.
        let program = command.split_whitespace().next().unwrap_or_default();
        if program.starts_with('/') {
            check_path_in_roots(std::path::Path::new(program), &guardrails.allowed_exec_roots)?;
        } else if guardrails.allowed_exec_roots.is_empty() {
            return Err(PolicyError::PathOutsideAllowedRoots {
                path: program.to_string(),
            }
            .into());
        }

        let _slot = ProcessSlot::acquire(&self.active, guardrails.max_processes)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn: {command}"))?;

        let timeout = std::time::Duration::from_secs(guardrails.exec_timeout_secs);
        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => {
                match result {
                    Ok(output) => output.context("failed to collect command output")?,
                    Err(_) => {
                        return Err(PolicyError::ToolTimeout {
                            seconds: guardrails.exec_timeout_secs,
                        }
                        .into());
                    }
                }
            }
            _ = cancel.cancelled() => {
                // kill_on_drop reaps the child; surface the cancellation.
                return Err(crate::error::AgentError::WorkerCancelled {
                    reason: "cancelled".to_string(),
                }
                .into());
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.stderr.is_empty() {
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        if combined.len() as u64 > guardrails.max_output_bytes {
            return Err(PolicyError::OutputTooLarge {
                max_bytes: guardrails.max_output_bytes,
            }
            .into());
        }

        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::PathBuf;

    fn open_guardrails() -> Arc<Guardrails> {
        let mut guardrails = Guardrails::default();
        guardrails.allowed_exec_roots = vec![PathBuf::from("/")];
        Arc::new(guardrails)
    }

    #[tokio::test]
    async fn runs_a_command_and_captures_output() {
        let tool = ExecTool::new();
        let output = tool
            .run("echo hello", &open_guardrails(), &CancellationToken::new())
            .await
            .expect("echo should run");
        assert_eq!(output.trim(), "hello");
    }

    #[tokio::test]
    async fn empty_exec_roots_deny() {
        let tool = ExecTool::new();
        let error = tool
            .run(
                "echo hello",
                &Arc::new(Guardrails::default()),
                &CancellationToken::new(),
            )
            .await
            .expect_err("empty roots must deny");
        assert_eq!(error.kind(), ErrorKind::PathOutsideAllowedRoots);
    }

    #[tokio::test]
    async fn denied_prefix_is_rejected_before_spawn() {
        let tool = ExecTool::new();
        let mut guardrails = Guardrails::default();
        guardrails.allowed_exec_roots = vec![PathBuf::from("/")];
        guardrails.denied_command_prefixes = vec!["rm ".to_string()];
        let error = tool
            .run("rm -r /tmp/x", &Arc::new(guardrails), &CancellationToken::new())
            .await
            .expect_err("denied prefix");
        assert_eq!(error.kind(), ErrorKind::DeniedCommandPrefix);
    }

    #[tokio::test]
    async fn timeout_produces_tool_timeout() {
        let tool = ExecTool::new();
        let mut guardrails = Guardrails::default();
        guardrails.allowed_exec_roots = vec![PathBuf::from("/")];
        guardrails.exec_timeout_secs = 1;
        let error = tool
            .run("sleep 5", &Arc::new(guardrails), &CancellationToken::new())
            .await
            .expect_err("must time out");
        assert_eq!(error.kind(), ErrorKind::ToolTimeout);
    }

    #[tokio::test]
    async fn process_cap_is_enforced_and_released() {
        let tool = ExecTool::new();
        let mut guardrails = Guardrails::default();
        guardrails.allowed_exec_roots = vec![PathBuf::from("/")];
        guardrails.max_processes = 1;
        let guardrails = Arc::new(guardrails);

        // Saturate the single slot manually, then verify rejection.
        let slot = ProcessSlot::acquire(&tool.active, 1).expect("first slot");
        let error = tool
            .run("echo hi", &guardrails, &CancellationToken::new())
            .await
            .expect_err("cap reached");
        assert_eq!(error.kind(), ErrorKind::ProcessLimitExceeded);

        drop(slot);
        assert!(tool
            .run("echo hi", &guardrails, &CancellationToken::new())
            .await
            .is_ok());
    }
}
