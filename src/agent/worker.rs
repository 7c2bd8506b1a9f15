//! Worker scheduler: durable, task-bound executors with a status machine.
//!
//! Workers are exclusively owned by the scheduler; every status change goes
//! through a validated transition and is persisted to the `workers`
//! aggregate. Progress application is serialized per channel through a
//! bounded dispatch queue so reports land in the log in order.

use crate::error::{AgentError, Error, ErrorKind, Result};
use crate::events::envelope::{EventEnvelope, MessageBody};
use crate::events::EventStore;
use crate::llm::{ChatMessage, LlmManager};
use crate::persist::{AggregateKind, Backend};
use crate::tools::catalog::{ToolArgs, ToolCatalog};
use crate::tools::PolicyService;
use crate::WorkerId;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// How long `route` waits for the worker's next report.
const ROUTE_REPLY_TIMEOUT_SECS: u64 = 60;

/// Per-channel dispatch queue depth for progress application.
const PROGRESS_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    FireAndForget,
    Interactive,
}

impl WorkerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerMode::FireAndForget => "fire_and_forget",
            WorkerMode::Interactive => "interactive",
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Queued,
    Running,
    WaitingInput,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Queued => "queued",
            WorkerStatus::Running => "running",
            WorkerStatus::WaitingInput => "waiting_input",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Completed | WorkerStatus::Failed)
    }

    /// Legal transitions of the worker status machine.
    pub fn can_transition_to(self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, target),
            (Queued, Running)
                | (Running, WaitingInput)
                | (Running, Completed)
                | (Running, Failed)
                | (WaitingInput, Running)
                | (WaitingInput, Failed)
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The worker aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub worker_id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub channel_id: String,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub mode: WorkerMode,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_report: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What to spawn.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub channel_id: String,
    /// Agent identity the worker's tool policy is checked against.
    pub agent_id: String,
    pub task_id: Option<String>,
    pub title: String,
    pub objective: String,
    pub tools: Vec<String>,
    pub mode: WorkerMode,
}

struct RoutedInput {
    message: String,
    reply: oneshot::Sender<String>,
}

struct WorkerEntry {
    worker: Worker,
    agent_id: String,
    input_tx: Option<mpsc::Sender<RoutedInput>>,
    cancel: CancellationToken,
}

/// Owns all workers and their transitions.
pub struct WorkerScheduler {
    store: Arc<EventStore>,
    backend: Arc<dyn Backend>,
    llm: Arc<LlmManager>,
    policy: Arc<PolicyService>,
    catalog: ToolCatalog,
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
    progress_pumps: Mutex<HashMap<String, mpsc::Sender<EventEnvelope>>>,
}

impl WorkerScheduler {
    pub fn new(
        store: Arc<EventStore>,
        backend: Arc<dyn Backend>,
        llm: Arc<LlmManager>,
        policy: Arc<PolicyService>,
    ) -> Self {
        Self {
            store,
            backend,
            llm,
            policy,
            catalog: ToolCatalog::new(),
            workers: RwLock::new(HashMap::new()),
            progress_pumps: Mutex::new(HashMap::new()),
        }
    }

    /// The per-channel progress queue, creating its pump on first use.
    async fn progress_tx(&self, channel_id: &str) -> mpsc::Sender<EventEnvelope> {
        let mut pumps = self.progress_pumps.lock().await;
        if let Some(tx) = pumps.get(channel_id) {
            return tx.clone();
        }
        let (tx, mut rx) = mpsc::channel::<EventEnvelope>(PROGRESS_QUEUE_DEPTH);
        let store = self.store.clone();
        let channel = channel_id.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(error) = store.append(envelope).await {
                    tracing::error!(channel_id = %channel, %error, "failed to apply worker progress");
                }
            }
        });
        pumps.insert(channel_id.to_string(), tx.clone());
        tx
    }

    async fn persist(&self, worker: &Worker) -> Result<()> {
        self.backend
            .put_aggregate(
                AggregateKind::Workers,
                &worker.worker_id.to_string(),
                serde_json::to_value(worker).context("serialize worker")?,
            )
            .await
    }

    /// Apply a validated status transition and persist it.
    async fn transition(&self, worker_id: WorkerId, target: WorkerStatus) -> Result<Worker> {
        let mut workers = self.workers.write().await;
        let entry = workers
            .get_mut(&worker_id)
            .ok_or_else(|| AgentError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        if !entry.worker.status.can_transition_to(target) {
            return Err(AgentError::InvalidStateTransition(format!(
                "worker {worker_id}: {} -> {}",
                entry.worker.status, target
            ))
            .into());
        }
        entry.worker.status = target;
        entry.worker.version += 1;
        entry.worker.updated_at = Utc::now();
        let snapshot = entry.worker.clone();
        drop(workers);

        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    async fn record_report(&self, worker_id: WorkerId, report: &str) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(&worker_id) {
            entry.worker.latest_report = Some(report.to_string());
            entry.worker.version += 1;
            entry.worker.updated_at = Utc::now();
        }
    }

    /// Spawn a worker. Appends `worker.spawned` and schedules the run.
    pub async fn spawn(self: &Arc<Self>, spec: WorkerSpec) -> Result<WorkerId> {
        let worker_id = uuid::Uuid::new_v4();
        let now = Utc::now();
        let worker = Worker {
            worker_id,
            task_id: spec.task_id.clone(),
            channel_id: spec.channel_id.clone(),
            title: spec.title.clone(),
            objective: spec.objective.clone(),
            tools: spec.tools.clone(),
            mode: spec.mode,
            status: WorkerStatus::Queued,
            latest_report: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let (input_tx, input_rx) = match spec.mode {
            WorkerMode::Interactive => {
                let (tx, rx) = mpsc::channel(8);
                (Some(tx), Some(rx))
            }
            WorkerMode::FireAndForget => (None, None),
        };
        let cancel = CancellationToken::new();

        {
            let mut workers = self.workers.write().await;
            workers.insert(
                worker_id,
                WorkerEntry {
                    worker: worker.clone(),
                    agent_id: spec.agent_id.clone(),
                    input_tx,
                    cancel: cancel.clone(),
                },
            );
        }
        self.persist(&worker).await?;

        let mut spawned = EventEnvelope::new(
            spec.channel_id.clone(),
            uuid::Uuid::new_v4().to_string(),
            MessageBody::WorkerSpawned {
                title: spec.title.clone(),
                objective: spec.objective.clone(),
                mode: spec.mode.as_str().to_string(),
                extra: serde_json::Map::new(),
            },
        )
        .with_worker(worker_id);
        if let Some(task_id) = &spec.task_id {
            spawned = spawned.with_task(task_id.clone());
        }
        self.store.append(spawned).await?;

        tracing::info!(
            worker_id = %worker_id,
            channel_id = %spec.channel_id,
            mode = %spec.mode,
            "worker spawned"
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_worker(worker_id, spec, input_rx, cancel).await;
        });

        Ok(worker_id)
    }

    /// The worker body: authorize tools, execute the objective, then either
    /// complete or enter the interactive loop.
    async fn run_worker(
        self: Arc<Self>,
        worker_id: WorkerId,
        spec: WorkerSpec,
        input_rx: Option<mpsc::Receiver<RoutedInput>>,
        cancel: CancellationToken,
    ) {
        if let Err(error) = self.transition(worker_id, WorkerStatus::Running).await {
            tracing::error!(worker_id = %worker_id, %error, "worker failed to start");
            return;
        }

        let report = match self.execute_objective(&spec, &cancel).await {
            Ok(report) => report,
            Err(error) => {
                self.fail(worker_id, &failure_reason(&error)).await;
                return;
            }
        };
        self.record_report(worker_id, &report).await;

        match spec.mode {
            WorkerMode::FireAndForget => {
                self.complete(worker_id, &report).await;
            }
            WorkerMode::Interactive => {
                self.send_progress(&spec, worker_id, &report).await;
                let Some(input_rx) = input_rx else {
                    self.fail(worker_id, "internal").await;
                    return;
                };
                self.interactive_loop(worker_id, &spec, input_rx, cancel, report)
                    .await;
            }
        }
    }

    /// Interactive workers park in `waiting_input` and wake per routed
    /// message. `fail`/`abort`/`stop` is an external interrupt; `done`
    /// finishes the worker.
    async fn interactive_loop(
        &self,
        worker_id: WorkerId,
        spec: &WorkerSpec,
        mut input_rx: mpsc::Receiver<RoutedInput>,
        cancel: CancellationToken,
        mut last_report: String,
    ) {
        if self
            .transition(worker_id, WorkerStatus::WaitingInput)
            .await
            .is_err()
        {
            return;
        }

        loop {
            let input = tokio::select! {
                input = input_rx.recv() => input,
                _ = cancel.cancelled() => {
                    self.fail(worker_id, "cancelled").await;
                    return;
                }
            };
            let Some(RoutedInput { message, reply }) = input else {
                // All routing handles dropped: finish with the last report.
                self.complete(worker_id, &last_report).await;
                return;
            };

            let trimmed = message.trim().to_lowercase();
            if matches!(trimmed.as_str(), "fail" | "abort" | "stop") {
                let _ = reply.send(format!("worker {worker_id} interrupted"));
                self.fail(worker_id, "interrupt").await;
                return;
            }

            if self
                .transition(worker_id, WorkerStatus::Running)
                .await
                .is_err()
            {
                let _ = reply.send(last_report.clone());
                return;
            }

            if matches!(trimmed.as_str(), "done" | "complete" | "finish") {
                let _ = reply.send(last_report.clone());
                self.complete(worker_id, &last_report).await;
                return;
            }

            let report = self.follow_up_report(spec, &message).await;
            self.record_report(worker_id, &report).await;
            self.send_progress(spec, worker_id, &report).await;
            last_report = report.clone();
            let _ = reply.send(report);

            if self
                .transition(worker_id, WorkerStatus::WaitingInput)
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// First pass over the objective: run any `$ command` directives through
    /// the guarded exec tool, then produce the report (provider-backed when a
    /// model is configured).
    async fn execute_objective(
        &self,
        spec: &WorkerSpec,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Every declared tool must be authorized for the agent before any
        // work happens.
        for tool_id in &spec.tools {
            self.policy.require(&spec.agent_id, tool_id)?;
        }

        let mut sections: Vec<String> = Vec::new();

        let directives: Vec<&str> = spec
            .objective
            .lines()
            .filter_map(|line| line.trim().strip_prefix("$ "))
            .collect();
        for command in directives {
            let guardrails = self.policy.require(&spec.agent_id, "exec.run")?;
            let output = self
                .catalog
                .invoke(
                    "exec.run",
                    ToolArgs::Exec {
                        command: command.to_string(),
                    },
                    &guardrails,
                    cancel,
                )
                .await?;
            sections.push(format!("$ {command}\n{output}"));
        }

        if self.llm.configured() {
            let messages = vec![
                ChatMessage::system(
                    "You are a task worker. Carry out the objective and report the outcome.",
                ),
                ChatMessage::user(spec.objective.clone()),
            ];
            match self.llm.complete(messages, 2048).await {
                Ok(completion) => sections.push(completion.content),
                Err(error) => {
                    tracing::warn!(%error, "worker provider call failed, reporting mechanically");
                    sections.push(format!(
                        "Objective acknowledged: {}",
                        spec.objective.lines().next().unwrap_or(&spec.objective)
                    ));
                }
            }
        } else if sections.is_empty() {
            sections.push(format!(
                "Objective acknowledged: {}",
                spec.objective.lines().next().unwrap_or(&spec.objective)
            ));
        }

        Ok(sections.join("\n\n"))
    }

    async fn follow_up_report(&self, spec: &WorkerSpec, message: &str) -> String {
        if self.llm.configured() {
            let messages = vec![
                ChatMessage::system(
                    "You are a task worker in an interactive session. Respond with a progress report.",
                ),
                ChatMessage::assistant(spec.objective.clone()),
                ChatMessage::user(message.to_string()),
            ];
            if let Ok(completion) = self.llm.complete(messages, 1024).await {
                return completion.content;
            }
        }
        format!("processed follow-up: {message}")
    }

    async fn send_progress(&self, spec: &WorkerSpec, worker_id: WorkerId, report: &str) {
        let mut envelope = EventEnvelope::new(
            spec.channel_id.clone(),
            uuid::Uuid::new_v4().to_string(),
            MessageBody::WorkerProgress {
                report: report.to_string(),
                extra: serde_json::Map::new(),
            },
        )
        .with_worker(worker_id);
        if let Some(task_id) = &spec.task_id {
            envelope = envelope.with_task(task_id.clone());
        }
        let tx = self.progress_tx(&spec.channel_id).await;
        if tx.send(envelope).await.is_err() {
            tracing::warn!(worker_id = %worker_id, "progress queue closed");
        }
    }

    async fn complete(&self, worker_id: WorkerId, report: &str) {
        let worker = match self.transition(worker_id, WorkerStatus::Completed).await {
            Ok(worker) => worker,
            Err(error) => {
                tracing::warn!(worker_id = %worker_id, %error, "completion transition failed");
                return;
            }
        };
        self.record_report(worker_id, report).await;

        let mut envelope = EventEnvelope::new(
            worker.channel_id.clone(),
            uuid::Uuid::new_v4().to_string(),
            MessageBody::WorkerCompleted {
                report: report.to_string(),
                extra: serde_json::Map::new(),
            },
        )
        .with_worker(worker_id);
        if let Some(task_id) = &worker.task_id {
            envelope = envelope.with_task(task_id.clone());
        }
        let tx = self.progress_tx(&worker.channel_id).await;
        let _ = tx.send(envelope).await;

        self.retire(worker_id).await;
        tracing::info!(worker_id = %worker_id, "worker completed");
    }

    async fn fail(&self, worker_id: WorkerId, reason: &str) {
        let worker = match self.transition(worker_id, WorkerStatus::Failed).await {
            Ok(worker) => worker,
            Err(error) => {
                tracing::warn!(worker_id = %worker_id, %error, "failure transition failed");
                return;
            }
        };

        let mut envelope = EventEnvelope::new(
            worker.channel_id.clone(),
            uuid::Uuid::new_v4().to_string(),
            MessageBody::WorkerFailed {
                reason: reason.to_string(),
                extra: serde_json::Map::new(),
            },
        )
        .with_worker(worker_id);
        if let Some(task_id) = &worker.task_id {
            envelope = envelope.with_task(task_id.clone());
        }
        let tx = self.progress_tx(&worker.channel_id).await;
        let _ = tx.send(envelope).await;

        self.retire(worker_id).await;
        tracing::warn!(worker_id = %worker_id, reason, "worker failed");
    }

    /// Drop the in-memory entry once terminal; the aggregate remains.
    async fn retire(&self, worker_id: WorkerId) {
        let removed = {
            let mut workers = self.workers.write().await;
            let terminal = workers
                .get(&worker_id)
                .is_some_and(|entry| entry.worker.status.is_terminal());
            if terminal {
                workers.remove(&worker_id).map(|entry| entry.worker)
            } else {
                None
            }
        };
        // Persist the final report alongside the terminal status.
        if let Some(worker) = removed {
            let _ = self.persist(&worker).await;
        }
    }

    /// Current view of a worker: live entry first, persisted aggregate as
    /// fallback for retired ones.
    pub async fn status(&self, worker_id: WorkerId) -> Result<Worker> {
        {
            let workers = self.workers.read().await;
            if let Some(entry) = workers.get(&worker_id) {
                return Ok(entry.worker.clone());
            }
        }
        let body = self
            .backend
            .get_aggregate(AggregateKind::Workers, &worker_id.to_string())
            .await?
            .ok_or_else(|| AgentError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        serde_json::from_value(body)
            .context("decode worker aggregate")
            .map_err(Into::into)
    }

    /// All workers, live and retired.
    pub async fn list(&self) -> Result<Vec<Worker>> {
        let mut by_id: HashMap<WorkerId, Worker> = HashMap::new();
        for (_, body) in self.backend.list_aggregates(AggregateKind::Workers).await? {
            if let Ok(worker) = serde_json::from_value::<Worker>(body) {
                by_id.insert(worker.worker_id, worker);
            }
        }
        {
            let workers = self.workers.read().await;
            for entry in workers.values() {
                by_id.insert(entry.worker.worker_id, entry.worker.clone());
            }
        }
        let mut list: Vec<Worker> = by_id.into_values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    /// Deliver a message to an interactive worker and wait for its next
    /// progress report.
    pub async fn route(&self, worker_id: WorkerId, message: &str) -> Result<String> {
        let input_tx = {
            let workers = self.workers.read().await;
            let entry = workers
                .get(&worker_id)
                .ok_or_else(|| AgentError::WorkerNotFound {
                    id: worker_id.to_string(),
                })?;
            if entry.worker.mode != WorkerMode::Interactive {
                return Err(AgentError::InvalidStateTransition(format!(
                    "worker {worker_id} is not interactive"
                ))
                .into());
            }
            if entry.worker.status != WorkerStatus::WaitingInput {
                return Err(AgentError::InvalidStateTransition(format!(
                    "worker {worker_id} is {}, not waiting_input",
                    entry.worker.status
                ))
                .into());
            }
            entry
                .input_tx
                .clone()
                .ok_or_else(|| AgentError::InvalidStateTransition(format!(
                    "worker {worker_id} has no input channel"
                )))?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        input_tx
            .send(RoutedInput {
                message: message.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| AgentError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        let timeout = std::time::Duration::from_secs(ROUTE_REPLY_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(AgentError::WorkerNotFound {
                id: worker_id.to_string(),
            }
            .into()),
            Err(_) => Err(AgentError::WorkerTimeout {
                seconds: ROUTE_REPLY_TIMEOUT_SECS,
            }
            .into()),
        }
    }

    /// External interrupt: cancel the run; the worker surfaces
    /// `failed{reason="cancelled"}`.
    pub async fn interrupt(&self, worker_id: WorkerId) -> Result<()> {
        let workers = self.workers.read().await;
        let entry = workers
            .get(&worker_id)
            .ok_or_else(|| AgentError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        entry.cancel.cancel();
        Ok(())
    }

    /// The agent identity a live worker runs under.
    pub async fn agent_of(&self, worker_id: WorkerId) -> Option<String> {
        let workers = self.workers.read().await;
        workers.get(&worker_id).map(|entry| entry.agent_id.clone())
    }

}

/// Short machine-grepable failure reason for an error.
fn failure_reason(error: &Error) -> String {
    match error.kind() {
        ErrorKind::ToolTimeout | ErrorKind::WorkerTimeout => "timeout".to_string(),
        ErrorKind::WorkerCancelled => "cancelled".to_string(),
        kind => kind.as_str().to_string(),
    }
}
