//! The session engine: per-agent conversation sessions over JSONL logs.
//!
//! Each session is an append-only event log on disk plus an in-memory
//! summary. Writes to one session are serialized through its handle's lock;
//! streams hang off a per-session fan-out.

use super::log::{
    AgentSessionEvent, Attachment, RunControlAction, RunState, SessionEventBody, SessionLogFile,
};
use super::stream::{StreamFanout, StreamUpdate};
use crate::agent::router::{self, ChannelFeatures, RouteDecision};
use crate::config::ConfigHandle;
use crate::error::{Result, SessionError};
use crate::identity::AgentStore;
use crate::llm::{ChatMessage, LlmManager};
use crate::persist::{AggregateKind, Backend};
use crate::tools::catalog::{ToolArgs, ToolCatalog};
use crate::tools::PolicyService;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// In-memory (and persisted) view of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionSummary {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An attachment as uploaded by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUpload {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub content_base64: Option<String>,
}

struct SessionHandle {
    summary: AgentSessionSummary,
    seq: u64,
    run_state: RunState,
    fanout: Arc<StreamFanout>,
}

pub struct SessionEngine {
    agents: Arc<AgentStore>,
    backend: Arc<dyn Backend>,
    llm: Arc<LlmManager>,
    policy: Arc<PolicyService>,
    catalog: ToolCatalog,
    config: Arc<ConfigHandle>,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionHandle>>>>,
}

impl SessionEngine {
    pub fn new(
        agents: Arc<AgentStore>,
        backend: Arc<dyn Backend>,
        llm: Arc<LlmManager>,
        policy: Arc<PolicyService>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self {
            agents,
            backend,
            llm,
            policy,
            catalog: ToolCatalog::new(),
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn log_file(&self, agent_id: &str, session_id: &str) -> SessionLogFile {
        SessionLogFile::new(
            self.config
                .load()
                .agent_dir(agent_id)
                .join("sessions")
                .join(format!("{session_id}.jsonl")),
        )
    }

    async fn persist_summary(&self, summary: &AgentSessionSummary) -> Result<()> {
        self.backend
            .put_aggregate(
                AggregateKind::Sessions,
                &summary.id,
                serde_json::to_value(summary).context("serialize session summary")?,
            )
            .await
    }

    /// The live handle for a session, loading it from persistence on first
    /// touch after a restart.
    async fn handle(&self, agent_id: &str, session_id: &str) -> Result<Arc<Mutex<SessionHandle>>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(session_id) {
                return Ok(handle.clone());
            }
        }

        let Some(body) = self
            .backend
            .get_aggregate(AggregateKind::Sessions, session_id)
            .await?
        else {
            return Err(SessionError::SessionNotFound {
                id: session_id.to_string(),
            }
            .into());
        };
        let summary: AgentSessionSummary =
            serde_json::from_value(body).context("decode session summary")?;
        if summary.agent_id != agent_id {
            return Err(SessionError::SessionNotFound {
                id: session_id.to_string(),
            }
            .into());
        }

        let seq = self
            .log_file(agent_id, session_id)
            .read_all()
            .await?
            .last()
            .map(|event| event.seq)
            .unwrap_or(0);

        let queue_depth = self.config.load().session.stream_queue_depth;
        let handle = Arc::new(Mutex::new(SessionHandle {
            summary,
            seq,
            run_state: RunState::Done,
            fanout: Arc::new(StreamFanout::new(queue_depth)),
        }));

        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(session_id.to_string())
            .or_insert(handle)
            .clone())
    }

    /// Append one event to the session log and stream it out.
    async fn append(
        &self,
        handle: &mut SessionHandle,
        body: SessionEventBody,
    ) -> Result<AgentSessionEvent> {
        handle.seq += 1;
        let event = AgentSessionEvent {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: handle.summary.id.clone(),
            seq: handle.seq,
            ts: Utc::now(),
            body,
        };
        self.log_file(&handle.summary.agent_id, &handle.summary.id)
            .append(&event)
            .await?;
        handle.fanout.publish(&event).await;
        Ok(event)
    }

    /// Create a session: `session_created` plus the scaffold bootstrap
    /// message.
    pub async fn create_session(
        &self,
        agent_id: &str,
        title: Option<String>,
        parent_session_id: Option<String>,
    ) -> Result<(AgentSessionSummary, Vec<AgentSessionEvent>)> {
        self.agents.require(agent_id).await?;

        let now = Utc::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let title = title.unwrap_or_else(|| "New session".to_string());
        let summary = AgentSessionSummary {
            id: session_id.clone(),
            agent_id: agent_id.to_string(),
            title: title.clone(),
            parent_session_id: parent_session_id.clone(),
            message_count: 0,
            last_message_preview: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let queue_depth = self.config.load().session.stream_queue_depth;
        let handle = Arc::new(Mutex::new(SessionHandle {
            summary: summary.clone(),
            seq: 0,
            run_state: RunState::Done,
            fanout: Arc::new(StreamFanout::new(queue_depth)),
        }));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), handle.clone());

        let bundle = self.agents.read_bundle(agent_id).await?;
        let mut guard = handle.lock().await;
        let mut events = Vec::new();
        events.push(
            self.append(
                &mut guard,
                SessionEventBody::SessionCreated {
                    title,
                    parent_session_id,
                },
            )
            .await?,
        );
        events.push(
            self.append(
                &mut guard,
                SessionEventBody::Message {
                    role: "system".to_string(),
                    content: bundle.bootstrap_content(),
                    attachments: vec![],
                },
            )
            .await?,
        );
        drop(guard);

        self.persist_summary(&summary).await?;

        // Link the child into the parent's log.
        if let Some(parent_id) = &summary.parent_session_id {
            match self.handle(agent_id, parent_id).await {
                Ok(parent) => {
                    let mut parent_guard = parent.lock().await;
                    self.append(
                        &mut parent_guard,
                        SessionEventBody::SubSession {
                            child_session_id: session_id.clone(),
                        },
                    )
                    .await?;
                }
                Err(error) => {
                    tracing::debug!(parent_id = %parent_id, %error, "parent session missing, skipping sub_session link");
                }
            }
        }

        tracing::info!(agent_id, session_id = %session_id, "session created");
        Ok((summary, events))
    }

    /// Post a user message: appends it, synthesizes the run status sequence
    /// and the assistant reply, and returns everything appended plus the
    /// route decision for the synthetic session channel.
    pub async fn post_message(
        &self,
        agent_id: &str,
        session_id: &str,
        content: &str,
        attachments: Vec<AttachmentUpload>,
    ) -> Result<(Vec<AgentSessionEvent>, RouteDecision)> {
        let handle = self.handle(agent_id, session_id).await?;
        let mut guard = handle.lock().await;

        let inline_cap = self.config.load().session.attachment_inline_cap_bytes;
        let attachments: Vec<Attachment> = attachments
            .into_iter()
            .map(|upload| {
                use base64::Engine as _;
                // The effective size is the larger of the declared size and
                // the actual decoded payload.
                let decoded_len = upload
                    .content_base64
                    .as_deref()
                    .and_then(|content| {
                        base64::engine::general_purpose::STANDARD.decode(content).ok()
                    })
                    .map(|bytes| bytes.len() as u64);
                let size_bytes = decoded_len.map_or(upload.size_bytes, |len| {
                    len.max(upload.size_bytes)
                });
                let oversized = size_bytes > inline_cap;
                Attachment {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: upload.name,
                    mime_type: upload.mime_type,
                    size_bytes,
                    content_base64: if oversized { None } else { upload.content_base64 },
                }
            })
            .collect();

        let mut events = Vec::new();
        events.push(
            self.append(
                &mut guard,
                SessionEventBody::Message {
                    role: "user".to_string(),
                    content: content.to_string(),
                    attachments,
                },
            )
            .await?,
        );

        guard.run_state = RunState::Thinking;
        events.push(
            self.append(&mut guard, SessionEventBody::RunStatus {
                state: RunState::Thinking,
            })
            .await?,
        );

        // `$ command` lines run through the guarded exec tool under the
        // agent's policy; both sides of the invocation land in the log.
        let directives: Vec<String> = content
            .lines()
            .filter_map(|line| line.trim().strip_prefix("$ "))
            .map(str::to_string)
            .collect();
        for command in directives {
            events.push(
                self.append(
                    &mut guard,
                    SessionEventBody::ToolCall {
                        tool_id: "exec.run".to_string(),
                        args: serde_json::json!({ "command": command }),
                    },
                )
                .await?,
            );

            let output = match self.policy.require(agent_id, "exec.run") {
                Ok(guardrails) => {
                    let cancel = tokio_util::sync::CancellationToken::new();
                    match self
                        .catalog
                        .invoke(
                            "exec.run",
                            ToolArgs::Exec {
                                command: command.clone(),
                            },
                            &guardrails,
                            &cancel,
                        )
                        .await
                    {
                        Ok(output) => serde_json::json!({ "output": output }),
                        Err(error) => serde_json::json!({ "error": error.kind().as_str() }),
                    }
                }
                Err(error) => serde_json::json!({ "error": error.kind().as_str() }),
            };
            events.push(
                self.append(
                    &mut guard,
                    SessionEventBody::ToolResult {
                        tool_id: "exec.run".to_string(),
                        output,
                    },
                )
                .await?,
            );
        }

        let lowered = content.to_lowercase();
        if lowered.contains("search") || lowered.contains("find") || lowered.contains("look up") {
            guard.run_state = RunState::Searching;
            events.push(
                self.append(&mut guard, SessionEventBody::RunStatus {
                    state: RunState::Searching,
                })
                .await?,
            );
        }

        guard.run_state = RunState::Responding;
        events.push(
            self.append(&mut guard, SessionEventBody::RunStatus {
                state: RunState::Responding,
            })
            .await?,
        );

        let assistant_content = self.assistant_reply(agent_id, content).await;
        events.push(
            self.append(
                &mut guard,
                SessionEventBody::Message {
                    role: "assistant".to_string(),
                    content: assistant_content.clone(),
                    attachments: vec![],
                },
            )
            .await?,
        );

        guard.run_state = RunState::Done;
        events.push(
            self.append(&mut guard, SessionEventBody::RunStatus {
                state: RunState::Done,
            })
            .await?,
        );

        guard.summary.message_count += 2;
        guard.summary.last_message_preview =
            Some(assistant_content.chars().take(120).collect::<String>());
        guard.summary.version += 1;
        guard.summary.updated_at = Utc::now();
        let summary = guard.summary.clone();
        drop(guard);
        self.persist_summary(&summary).await?;

        // The decision is derived as if the message had arrived on a
        // synthetic channel for this session.
        let synthetic_channel = format!("agent:{agent_id}:session:{session_id}");
        let decision = router::decide(
            content,
            &ChannelFeatures::default(),
            &self.config.load().routing,
        );
        tracing::debug!(
            channel_id = %synthetic_channel,
            action = %decision.action,
            "session message routed"
        );

        Ok((events, decision))
    }

    async fn assistant_reply(&self, agent_id: &str, content: &str) -> String {
        if self.llm.configured() {
            let bundle = self.agents.read_bundle(agent_id).await.unwrap_or_default();
            let messages = vec![
                ChatMessage::system(bundle.bootstrap_content()),
                ChatMessage::user(content.to_string()),
            ];
            match self.llm.complete(messages, 1024).await {
                Ok(completion) => return completion.content,
                Err(error) => {
                    tracing::warn!(agent_id, %error, "session provider call failed");
                }
            }
        }
        let excerpt: String = content.chars().take(80).collect();
        format!("[{agent_id}] received: {excerpt}")
    }

    /// Pause/resume/interrupt. `interrupt` moves any in-flight run to
    /// `interrupted`.
    pub async fn control(
        &self,
        agent_id: &str,
        session_id: &str,
        action: RunControlAction,
        requested_by: &str,
        reason: Option<String>,
    ) -> Result<AgentSessionEvent> {
        let handle = self.handle(agent_id, session_id).await?;
        let mut guard = handle.lock().await;

        let event = self
            .append(
                &mut guard,
                SessionEventBody::RunControl {
                    action,
                    requested_by: requested_by.to_string(),
                    reason,
                },
            )
            .await?;

        if action == RunControlAction::Interrupt && guard.run_state != RunState::Done {
            guard.run_state = RunState::Interrupted;
        }

        Ok(event)
    }

    /// Subscribe to the session's stream from its current tail.
    pub async fn stream(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<mpsc::Receiver<StreamUpdate>> {
        let handle = self.handle(agent_id, session_id).await?;
        let guard = handle.lock().await;
        Ok(guard.fanout.subscribe().await)
    }

    pub async fn get(&self, agent_id: &str, session_id: &str) -> Result<AgentSessionSummary> {
        let handle = self.handle(agent_id, session_id).await?;
        let guard = handle.lock().await;
        Ok(guard.summary.clone())
    }

    /// Full event history for the detail endpoint.
    pub async fn events(&self, agent_id: &str, session_id: &str) -> Result<Vec<AgentSessionEvent>> {
        self.handle(agent_id, session_id).await?;
        self.log_file(agent_id, session_id).read_all().await
    }

    pub async fn list(&self, agent_id: &str) -> Result<Vec<AgentSessionSummary>> {
        self.agents.require(agent_id).await?;
        let rows = self.backend.list_aggregates(AggregateKind::Sessions).await?;
        let mut summaries: Vec<AgentSessionSummary> = rows
            .into_iter()
            .filter_map(|(_, body)| serde_json::from_value::<AgentSessionSummary>(body).ok())
            .filter(|summary| summary.agent_id == agent_id)
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    /// Delete a session: the on-disk log goes with it and any active stream
    /// subscribers receive a terminal `end_of_stream`.
    pub async fn delete(&self, agent_id: &str, session_id: &str) -> Result<()> {
        let handle = self.handle(agent_id, session_id).await?;
        {
            let guard = handle.lock().await;
            guard.fanout.close().await;
        }
        self.sessions.write().await.remove(session_id);
        self.backend
            .delete_aggregate(AggregateKind::Sessions, session_id)
            .await?;
        self.log_file(agent_id, session_id).delete().await?;
        tracing::info!(agent_id, session_id, "session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::persist::MemoryBackend;
    use crate::sessions::stream::StreamKind;

    struct Fixture {
        engine: SessionEngine,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut runtime_config = RuntimeConfig::default();
        runtime_config.workspace_root = dir.path().to_path_buf();
        let config = ConfigHandle::new(runtime_config);
        let backend = MemoryBackend::new();
        let agents = Arc::new(AgentStore::new(backend.clone(), dir.path().to_path_buf()));
        agents
            .create("overlord", "Overlord", "orchestrator")
            .await
            .expect("agent");
        let llm = Arc::new(LlmManager::new(config.clone()));
        let policy = Arc::new(PolicyService::new(config.clone()));
        Fixture {
            engine: SessionEngine::new(agents, backend, llm, policy, config),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn create_emits_bootstrap_with_the_tag() {
        let fixture = fixture().await;
        let (summary, events) = fixture
            .engine
            .create_session("overlord", Some("planning".into()), None)
            .await
            .expect("create");

        assert_eq!(summary.agent_id, "overlord");
        assert_eq!(events.len(), 2);
        match &events[0].body {
            SessionEventBody::SessionCreated { title, .. } => assert_eq!(title, "planning"),
            other => panic!("unexpected body: {other:?}"),
        }
        match &events[1].body {
            SessionEventBody::Message { role, content, .. } => {
                assert_eq!(role, "system");
                assert!(content.contains("[agent_session_context_bootstrap_v1]"));
                assert!(content.contains("## Soul.md"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn child_session_links_into_the_parent_log() {
        let fixture = fixture().await;
        let (parent, _) = fixture
            .engine
            .create_session("overlord", Some("parent".into()), None)
            .await
            .expect("parent");
        let (child, _) = fixture
            .engine
            .create_session("overlord", Some("child".into()), Some(parent.id.clone()))
            .await
            .expect("child");

        let parent_events = fixture
            .engine
            .events("overlord", &parent.id)
            .await
            .expect("events");
        assert!(parent_events.iter().any(|event| matches!(
            &event.body,
            SessionEventBody::SubSession { child_session_id } if *child_session_id == child.id
        )));
    }

    #[tokio::test]
    async fn post_message_synthesizes_the_run_sequence() {
        let fixture = fixture().await;
        let (summary, _) = fixture
            .engine
            .create_session("overlord", None, None)
            .await
            .expect("create");

        let (events, decision) = fixture
            .engine
            .post_message("overlord", &summary.id, "hello there", vec![])
            .await
            .expect("post");

        let kinds: Vec<&str> = events
            .iter()
            .map(|event| match &event.body {
                SessionEventBody::Message { role, .. } => role.as_str(),
                SessionEventBody::RunStatus { state } => match state {
                    RunState::Thinking => "thinking",
                    RunState::Searching => "searching",
                    RunState::Responding => "responding",
                    RunState::Done => "done",
                    RunState::Interrupted => "interrupted",
                },
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["user", "thinking", "responding", "assistant", "done"]);
        assert_eq!(decision.action, crate::agent::RouteAction::Respond);

        let refreshed = fixture
            .engine
            .get("overlord", &summary.id)
            .await
            .expect("get");
        assert_eq!(refreshed.message_count, 2);
        assert!(refreshed.last_message_preview.is_some());
    }

    #[tokio::test]
    async fn exec_directive_logs_tool_call_and_guarded_result() {
        let fixture = fixture().await;
        let (summary, _) = fixture
            .engine
            .create_session("overlord", None, None)
            .await
            .expect("create");

        let (events, _) = fixture
            .engine
            .post_message("overlord", &summary.id, "$ echo hi", vec![])
            .await
            .expect("post");

        let call = events
            .iter()
            .find(|event| matches!(event.body, SessionEventBody::ToolCall { .. }))
            .expect("tool_call recorded");
        match &call.body {
            SessionEventBody::ToolCall { tool_id, args } => {
                assert_eq!(tool_id, "exec.run");
                assert_eq!(args["command"], "echo hi");
            }
            other => panic!("unexpected body: {other:?}"),
        }

        // Scaffold guardrails ship with empty exec roots, so the invocation
        // is denied at the path check and the denial lands in the log.
        let result = events
            .iter()
            .find(|event| matches!(event.body, SessionEventBody::ToolResult { .. }))
            .expect("tool_result recorded");
        match &result.body {
            SessionEventBody::ToolResult { output, .. } => {
                assert_eq!(output["error"], "path_outside_allowed_roots");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn searchy_message_adds_the_searching_state() {
        let fixture = fixture().await;
        let (summary, _) = fixture
            .engine
            .create_session("overlord", None, None)
            .await
            .expect("create");

        let (events, _) = fixture
            .engine
            .post_message("overlord", &summary.id, "find the latest report", vec![])
            .await
            .expect("post");
        assert!(events.iter().any(|event| matches!(
            event.body,
            SessionEventBody::RunStatus {
                state: RunState::Searching
            }
        )));
    }

    #[tokio::test]
    async fn oversized_attachment_keeps_metadata_only() {
        let fixture = fixture().await;
        let (summary, _) = fixture
            .engine
            .create_session("overlord", None, None)
            .await
            .expect("create");

        let cap = fixture.engine.config.load().session.attachment_inline_cap_bytes;
        let (events, _) = fixture
            .engine
            .post_message(
                "overlord",
                &summary.id,
                "see attachments",
                vec![
                    AttachmentUpload {
                        name: "small.txt".into(),
                        mime_type: "text/plain".into(),
                        size_bytes: 16,
                        content_base64: Some("aGVsbG8=".into()),
                    },
                    AttachmentUpload {
                        name: "huge.bin".into(),
                        mime_type: "application/octet-stream".into(),
                        size_bytes: cap + 1,
                        content_base64: Some("eHh4".into()),
                    },
                ],
            )
            .await
            .expect("post");

        let attachments = match &events[0].body {
            SessionEventBody::Message { attachments, .. } => attachments,
            other => panic!("unexpected body: {other:?}"),
        };
        assert_eq!(attachments.len(), 2);
        assert!(attachments[0].content_base64.is_some());
        assert!(attachments[1].content_base64.is_none());
        assert!(!attachments[1].id.is_empty());
    }

    #[tokio::test]
    async fn stream_sees_tail_events_and_deletion() {
        let fixture = fixture().await;
        let (summary, _) = fixture
            .engine
            .create_session("overlord", None, None)
            .await
            .expect("create");

        let mut rx = fixture
            .engine
            .stream("overlord", &summary.id)
            .await
            .expect("stream");
        assert_eq!(rx.recv().await.unwrap().kind, StreamKind::SessionReady);

        fixture
            .engine
            .post_message("overlord", &summary.id, "ping", vec![])
            .await
            .expect("post");
        let chunk = rx.recv().await.expect("event chunk");
        assert_eq!(chunk.kind, StreamKind::Event);

        // Drain the synthesized run events, then delete.
        while let Ok(chunk) = rx.try_recv() {
            assert_ne!(chunk.kind, StreamKind::SessionReady);
        }
        fixture
            .engine
            .delete("overlord", &summary.id)
            .await
            .expect("delete");
        loop {
            match rx.recv().await {
                Some(chunk) if chunk.kind == StreamKind::EndOfStream => break,
                Some(_) => continue,
                None => panic!("stream closed without end_of_stream"),
            }
        }

        let error = fixture
            .engine
            .get("overlord", &summary.id)
            .await
            .expect_err("session gone");
        assert_eq!(error.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn interrupt_marks_the_run_interrupted() {
        let fixture = fixture().await;
        let (summary, _) = fixture
            .engine
            .create_session("overlord", None, None)
            .await
            .expect("create");

        let event = fixture
            .engine
            .control(
                "overlord",
                &summary.id,
                RunControlAction::Interrupt,
                "operator",
                Some("stop".into()),
            )
            .await
            .expect("control");
        match event.body {
            SessionEventBody::RunControl { action, .. } => {
                assert_eq!(action, RunControlAction::Interrupt);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
