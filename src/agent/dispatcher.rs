//! Channel dispatcher: the single ingest entry point.
//!
//! Ingest → authorize → route → dispatch → notify. The message append, the
//! route decision, and the decision append happen under the channel's lock so
//! the decision envelope's position is always greater than its trigger's.
//! Execution, compactor notification, and visor observation run as parallel
//! tasks afterwards.

use super::branch::BranchRuntime;
use super::compactor::Compactor;
use super::router::{self, ChannelFeatures, RouteAction, RouteDecision};
use super::worker::{WorkerMode, WorkerScheduler, WorkerSpec};
use crate::artifacts::ArtifactStore;
use crate::config::ConfigHandle;
use crate::error::{AgentError, Result};
use crate::events::envelope::{EventEnvelope, MessageBody};
use crate::events::EventStore;
use crate::llm::{ChatMessage, LlmManager};
use crate::plugins::PluginManager;
use crate::tools::PolicyService;
use crate::WorkerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument as _;

/// The acknowledgement sent when no model provider is configured.
const INLINE_FALLBACK_REPLY: &str = "Responded inline";

/// One inbound message.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub user_id: String,
    pub content: String,
    /// Platform-assigned id for at-least-once dedup; generated when absent.
    pub message_id: Option<String>,
}

/// What the dispatcher did with a message.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub message_id: String,
    pub trace_id: String,
    pub position: u64,
    pub decision: RouteDecision,
}

/// Sliding-window rate limiter keyed by agent id.
#[derive(Default)]
struct RateLimiter {
    windows: std::sync::Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    fn allow(&self, agent_id: &str, max_per_minute: u32) -> bool {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows.entry(agent_id.to_string()).or_default();
        let cutoff = Instant::now() - std::time::Duration::from_secs(60);
        window.retain(|instant| *instant > cutoff);
        if window.len() >= max_per_minute as usize {
            return false;
        }
        window.push(Instant::now());
        true
    }
}

pub struct Dispatcher {
    store: Arc<EventStore>,
    compactor: Arc<Compactor>,
    scheduler: Arc<WorkerScheduler>,
    branch: BranchRuntime,
    llm: Arc<LlmManager>,
    policy: Arc<PolicyService>,
    plugins: Arc<PluginManager>,
    config: Arc<ConfigHandle>,
    rate: RateLimiter,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<EventStore>,
        compactor: Arc<Compactor>,
        scheduler: Arc<WorkerScheduler>,
        llm: Arc<LlmManager>,
        policy: Arc<PolicyService>,
        plugins: Arc<PluginManager>,
        artifacts: Arc<ArtifactStore>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        let branch = BranchRuntime::new(store.clone(), llm.clone(), artifacts);
        Self {
            store,
            compactor,
            scheduler,
            branch,
            llm,
            policy,
            plugins,
            config,
            rate: RateLimiter::default(),
        }
    }

    /// Ingest one message on a channel.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn ingest(
        self: &Arc<Self>,
        channel_id: &str,
        request: IngestRequest,
    ) -> Result<IngestOutcome> {
        // Quarantined channels reject ingest outright.
        if self.compactor.is_quarantined(channel_id).await {
            return Err(AgentError::ChannelOverloaded {
                id: channel_id.to_string(),
            }
            .into());
        }

        // Plugin-bound channels may veto inbound traffic.
        let verdict = self
            .plugins
            .validate_inbound(channel_id, &request.user_id, &request.content)
            .await?;
        if !verdict.allowed {
            return Err(AgentError::PluginRejected {
                reason: verdict.reason.unwrap_or_else(|| "validate denied".to_string()),
            }
            .into());
        }

        let trace_id = uuid::Uuid::new_v4().to_string();
        let agent_id = self.config.load().default_agent_id.clone();
        let routing = self.config.load().routing.clone();

        // Message append, decision, and decision append are causally ordered
        // under the channel lock.
        let lock = self.store.channel_lock(channel_id);
        let guard = lock.lock().await;

        let snapshot = self.store.snapshot(channel_id).await?;
        let features = ChannelFeatures {
            prior_action: snapshot.last_decision.as_ref().map(|d| d.action),
            open_workers: snapshot.active_worker_ids.len(),
            utilization: snapshot.context_utilization,
        };
        let decision = router::decide(&request.content, &features, &routing);

        // Tool-involving actions are rate-limited per agent before anything
        // is appended.
        if decision.action == RouteAction::SpawnWorker {
            let guardrails = self.policy.guardrails(&agent_id);
            if !self.rate.allow(&agent_id, guardrails.max_tool_calls_per_minute) {
                return Err(AgentError::RateLimited { agent_id }.into());
            }
        }

        let mut message = EventEnvelope::new(
            channel_id,
            trace_id.clone(),
            MessageBody::ChannelMessageReceived {
                user_id: request.user_id.clone(),
                content: request.content.clone(),
                extra: serde_json::Map::new(),
            },
        );
        if let Some(message_id) = request.message_id {
            message.message_id = message_id;
        }
        let message_id = message.message_id.clone();
        let position = self.store.append(message).await?;

        self.store
            .append(EventEnvelope::new(
                channel_id,
                trace_id.clone(),
                MessageBody::ChannelRouteDecided {
                    decision: decision.clone(),
                    extra: serde_json::Map::new(),
                },
            ))
            .await?;
        drop(guard);

        tracing::info!(
            channel_id,
            trace_id = %trace_id,
            action = %decision.action,
            reason = %decision.reason,
            "message routed"
        );

        // Execution and compactor notification run off the ingest path; the
        // visor observes through the store broadcast.
        let dispatcher = Arc::clone(self);
        let execute_channel = channel_id.to_string();
        let execute_trace = trace_id.clone();
        let execute_decision = decision.clone();
        let content = request.content;
        tokio::spawn(
            async move {
                dispatcher
                    .execute(&execute_channel, &execute_trace, &content, &execute_decision)
                    .await;
            }
            .in_current_span(),
        );

        let compactor = self.compactor.clone();
        let observe_channel = channel_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = compactor.observe(&observe_channel).await {
                tracing::warn!(channel_id = %observe_channel, %error, "compactor observation failed");
            }
        });

        Ok(IngestOutcome {
            message_id,
            trace_id,
            position,
            decision,
        })
    }

    /// Execute a route decision. Failures here never propagate to the ingest
    /// caller; workers surface theirs as `worker.failed` envelopes.
    async fn execute(&self, channel_id: &str, trace_id: &str, content: &str, decision: &RouteDecision) {
        match decision.action {
            RouteAction::Respond => {
                self.respond_inline(channel_id, trace_id, content, decision.token_budget)
                    .await;
            }
            RouteAction::SpawnBranch => {
                if let Err(error) = self
                    .branch
                    .run(channel_id, trace_id, content, decision.token_budget)
                    .await
                {
                    tracing::error!(channel_id, %error, "branch execution failed");
                }
            }
            RouteAction::SpawnWorker => {
                let title = content
                    .lines()
                    .next()
                    .unwrap_or(content)
                    .chars()
                    .take(64)
                    .collect::<String>();
                let spec = WorkerSpec {
                    channel_id: channel_id.to_string(),
                    agent_id: self.config.load().default_agent_id.clone(),
                    task_id: None,
                    title,
                    objective: content.to_string(),
                    tools: Vec::new(),
                    mode: WorkerMode::FireAndForget,
                };
                if let Err(error) = self.scheduler.spawn(spec).await {
                    tracing::error!(channel_id, %error, "worker spawn failed");
                }
            }
        }
    }

    /// Inline reply: provider-backed when configured, the static
    /// acknowledgement otherwise. The reply lands in the log and is delivered
    /// to the channel's plugin.
    async fn respond_inline(&self, channel_id: &str, trace_id: &str, content: &str, budget: u32) {
        let (reply, via_provider) = if self.llm.configured() {
            let messages = vec![
                ChatMessage::system("Reply to the user's message, briefly and directly."),
                ChatMessage::user(content.to_string()),
            ];
            match self.llm.complete(messages, budget).await {
                Ok(completion) => (completion.content, true),
                Err(error) => {
                    tracing::warn!(channel_id, %error, "inline reply provider call failed");
                    (error.kind().as_str().to_string(), false)
                }
            }
        } else {
            (INLINE_FALLBACK_REPLY.to_string(), false)
        };

        let envelope = EventEnvelope::new(
            channel_id,
            trace_id,
            MessageBody::ChannelReplySent {
                content: reply.clone(),
                via_provider,
                extra: serde_json::Map::new(),
            },
        );
        if let Err(error) = self.store.append(envelope).await {
            tracing::error!(channel_id, %error, "failed to record inline reply");
            return;
        }

        self.plugins.deliver(channel_id, "system", &reply).await;
    }

    /// Route a follow-up message to an interactive worker on this channel.
    pub async fn route_to_worker(
        &self,
        channel_id: &str,
        worker_id: WorkerId,
        message: &str,
    ) -> Result<String> {
        let worker = self.scheduler.status(worker_id).await?;
        if worker.channel_id != channel_id {
            return Err(AgentError::WorkerNotFound {
                id: worker_id.to_string(),
            }
            .into());
        }
        self.scheduler.route(worker_id, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::persist::MemoryBackend;
    use crate::tools::{AgentToolsPolicy, PolicyService};

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        store: Arc<EventStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(mutate: impl FnOnce(&mut RuntimeConfig)) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut runtime_config = RuntimeConfig::default();
        runtime_config.workspace_root = dir.path().to_path_buf();
        mutate(&mut runtime_config);
        let config = ConfigHandle::new(runtime_config);
        let backend = MemoryBackend::new();
        let store = Arc::new(EventStore::new(backend.clone(), config.clone()));
        let llm = Arc::new(LlmManager::new(config.clone()));
        let policy = Arc::new(PolicyService::new(config.clone()));
        policy
            .write_policy("overlord", &AgentToolsPolicy::scaffold())
            .expect("policy");
        let compactor = Arc::new(Compactor::new(store.clone(), llm.clone(), config.clone()));
        let scheduler = Arc::new(WorkerScheduler::new(
            store.clone(),
            backend.clone(),
            llm.clone(),
            policy.clone(),
        ));
        let plugins = Arc::new(PluginManager::new(backend.clone()));
        let artifacts = Arc::new(ArtifactStore::new(dir.path().to_path_buf(), backend));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            compactor,
            scheduler,
            llm,
            policy,
            plugins,
            artifacts,
            config,
        ));
        Fixture {
            dispatcher,
            store,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn request(content: &str) -> IngestRequest {
        IngestRequest {
            user_id: "u1".to_string(),
            content: content.to_string(),
            message_id: None,
        }
    }

    async fn wait_for_type(store: &EventStore, channel: &str, message_type: &str) {
        for _ in 0..200 {
            let stored = store.read(channel, 1).await.unwrap();
            if stored
                .iter()
                .any(|item| item.envelope.message_type() == message_type)
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("{message_type} never appeared on {channel}");
    }

    #[tokio::test]
    async fn decision_envelope_follows_its_trigger() {
        let fixture = fixture();
        let outcome = fixture
            .dispatcher
            .ingest("general", request("hello there"))
            .await
            .expect("ingest");

        let stored = fixture.store.read("general", 1).await.unwrap();
        let message = stored
            .iter()
            .find(|item| item.envelope.message_type() == "channel.message.received")
            .expect("message envelope");
        let decided = stored
            .iter()
            .find(|item| item.envelope.message_type() == "channel.route.decided")
            .expect("decision envelope");

        assert!(decided.position > message.position);
        assert_eq!(decided.envelope.trace_id, message.envelope.trace_id);
        assert_eq!(outcome.position, message.position);
    }

    #[tokio::test]
    async fn inline_reply_without_provider_is_the_fallback() {
        let fixture = fixture();
        fixture
            .dispatcher
            .ingest("general", request("hi!"))
            .await
            .expect("ingest");

        wait_for_type(&fixture.store, "general", "channel.reply.sent").await;
        let snapshot = fixture.store.snapshot("general").await.unwrap();
        let last_system = snapshot
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "system")
            .expect("system reply");
        assert_eq!(last_system.content, INLINE_FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn branchy_message_spawns_a_branch() {
        let fixture = fixture();
        let outcome = fixture
            .dispatcher
            .ingest("general", request("compare sqlite and postgres for this"))
            .await
            .expect("ingest");
        assert_eq!(outcome.decision.action, RouteAction::SpawnBranch);

        wait_for_type(&fixture.store, "general", "branch.spawned").await;
        wait_for_type(&fixture.store, "general", "branch.conclusion").await;
    }

    #[tokio::test]
    async fn worker_message_spawns_a_worker() {
        let fixture = fixture();
        let outcome = fixture
            .dispatcher
            .ingest("general", request("run the database migration now"))
            .await
            .expect("ingest");
        assert_eq!(outcome.decision.action, RouteAction::SpawnWorker);

        wait_for_type(&fixture.store, "general", "worker.spawned").await;
        wait_for_type(&fixture.store, "general", "worker.completed").await;
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let fixture = fixture();
        let mut first = request("hello");
        first.message_id = Some("m-dup".to_string());
        fixture
            .dispatcher
            .ingest("general", first)
            .await
            .expect("first ingest");

        let mut second = request("hello again");
        second.message_id = Some("m-dup".to_string());
        let error = fixture
            .dispatcher
            .ingest("general", second)
            .await
            .expect_err("duplicate id");
        assert_eq!(error.kind(), crate::error::ErrorKind::DuplicateMessageId);
    }

    #[tokio::test]
    async fn worker_spawns_are_rate_limited() {
        let fixture = fixture_with(|_| {});
        // Drop the agent's budget to one tool-involving ingest per minute.
        let policy_path = fixture
            .dispatcher
            .policy
            .policy_path("overlord");
        let mut policy = AgentToolsPolicy::scaffold();
        policy.guardrails.max_tool_calls_per_minute = 1;
        std::fs::write(
            &policy_path,
            serde_json::to_string_pretty(&policy).expect("serialize"),
        )
        .expect("write policy");

        fixture
            .dispatcher
            .ingest("general", request("run the first job"))
            .await
            .expect("first spawn allowed");
        let error = fixture
            .dispatcher
            .ingest("general", request("run the second job"))
            .await
            .expect_err("second spawn limited");
        assert_eq!(error.kind(), crate::error::ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn empty_message_still_routes() {
        let fixture = fixture();
        let outcome = fixture
            .dispatcher
            .ingest("general", request(""))
            .await
            .expect("ingest");
        assert_eq!(outcome.decision.action, RouteAction::Respond);
    }
}
