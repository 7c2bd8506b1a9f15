//! Visor: reads conversation content to manage backlog tasks, and drives
//! tasks through their lifecycle on worker events.
//!
//! Two loops run for the process lifetime: an observation loop over the
//! event store's broadcast (extraction + worker completion/failure sync) and
//! a ready-task loop that binds `ready` tasks to actors and spawns workers.

use super::store::{ProjectStore, Task, TaskPriority, TaskStatus, TaskUpdate};
use crate::agent::worker::{WorkerMode, WorkerScheduler, WorkerSpec};
use crate::artifacts::ArtifactStore;
use crate::board::{may_claim_actor, BoardStore};
use crate::config::ConfigHandle;
use crate::error::Result;
use crate::events::envelope::{EventEnvelope, MessageBody};
use crate::events::{EventStore, StoredEnvelope};
use crate::WorkerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::RwLock;

/// A visor announcement retained for the bulletins feed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bulletin {
    pub id: String,
    pub project_id: String,
    pub channel_id: String,
    pub content: String,
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A parsed approval command target.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ApprovalRef {
    /// 1-based index into the project's current backlog.
    Index(usize),
    /// Literal task id.
    Id(String),
}

fn approval_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\bpick\s+up\s+#\s*(?:([0-9]+)|([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}))\b",
        )
        .expect("static regex compiles")
    })
}

fn parse_approval(content: &str) -> Option<ApprovalRef> {
    let captures = approval_regex().captures(content)?;
    if let Some(index) = captures.get(1) {
        return index.as_str().parse::<usize>().ok().map(ApprovalRef::Index);
    }
    captures
        .get(2)
        .map(|id| ApprovalRef::Id(id.as_str().to_lowercase()))
}

/// The TODO extraction rules. The set is intentionally extensible: each rule
/// captures the task title as group 1.
fn extraction_rules() -> &'static Vec<regex::Regex> {
    static RULES: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            // - [ ] bullet TODOs
            r"(?m)^\s*[-*]\s*\[ \]\s*(.+)$",
            // TODO: prefixes
            r"(?m)^\s*TODO:\s*(.+)$",
            // Cyrillic imperative markers
            r"(?mi)^\s*(?:нужно|надо)\s+(.+)$",
            // Latin imperative markers; the whole line is the task
            r"(?mi)^\s*((?:please\s+)?prepare\s+.+)$",
        ]
        .iter()
        .map(|pattern| regex::Regex::new(pattern).expect("static regex compiles"))
        .collect()
    })
}

/// Normalize a title for in-message dedup: collapse whitespace, strip
/// trailing punctuation. Case is preserved: `Prepare X` and `prepare X`
/// are distinct tasks.
fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!', '?'])
        .to_string()
}

/// Extract deduplicated task titles from one message.
fn extract_todos(content: &str) -> Vec<String> {
    let mut titles = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for rule in extraction_rules() {
        for captures in rule.captures_iter(content) {
            let Some(raw) = captures.get(1) else { continue };
            let title = normalize_title(raw.as_str());
            if title.is_empty() {
                continue;
            }
            if seen.insert(title.clone()) {
                titles.push(title);
            }
        }
    }
    titles
}

pub struct Visor {
    projects: Arc<ProjectStore>,
    board: Arc<BoardStore>,
    scheduler: Arc<WorkerScheduler>,
    store: Arc<EventStore>,
    artifacts: Arc<ArtifactStore>,
    config: Arc<ConfigHandle>,
    bulletins: RwLock<Vec<Bulletin>>,
}

impl Visor {
    pub fn new(
        projects: Arc<ProjectStore>,
        board: Arc<BoardStore>,
        scheduler: Arc<WorkerScheduler>,
        store: Arc<EventStore>,
        artifacts: Arc<ArtifactStore>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self {
            projects,
            board,
            scheduler,
            store,
            artifacts,
            config,
            bulletins: RwLock::new(Vec::new()),
        }
    }

    /// Start the observation and ready-task loops.
    ///
    /// The broadcast subscription is taken before the task is spawned so an
    /// append racing the spawn cannot be missed.
    pub fn spawn_loops(self: Arc<Self>) {
        let mut rx = self.store.subscribe();
        let observer = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(stored) => {
                        if let Err(error) = observer.handle_stored(&stored).await {
                            tracing::warn!(%error, "visor observation failed");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "visor lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let binder = self;
        tokio::spawn(async move {
            let interval = binder.config.load().visor.ready_poll_interval_ms;
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval.max(50)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(error) = binder.bind_ready_tasks().await {
                    tracing::warn!(%error, "ready-task binding pass failed");
                }
            }
        });
    }

    /// Dispatch one observed envelope.
    pub async fn handle_stored(&self, stored: &StoredEnvelope) -> Result<()> {
        let envelope = &stored.envelope;
        match &envelope.body {
            MessageBody::ChannelMessageReceived { content, .. } => {
                self.on_message(&envelope.channel_id, content).await
            }
            MessageBody::WorkerCompleted { report, .. } => {
                if let (Some(task_id), Some(worker_id)) = (&envelope.task_id, envelope.worker_id) {
                    self.on_worker_completed(task_id, worker_id, report).await
                } else {
                    Ok(())
                }
            }
            MessageBody::WorkerFailed { reason, .. } => {
                if let Some(task_id) = &envelope.task_id {
                    self.on_worker_failed(task_id, reason).await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Extraction duty: TODOs become backlog tasks; approval commands move
    /// tasks to `ready`. No project for the channel means no side effects.
    pub async fn on_message(&self, channel_id: &str, content: &str) -> Result<()> {
        let Some(project) = self.projects.project_for_channel(channel_id).await? else {
            return Ok(());
        };

        if let Some(reference) = parse_approval(content) {
            return self.approve(&project.id, reference).await;
        }

        let titles = extract_todos(content);
        if titles.is_empty() {
            return Ok(());
        }

        let mut task_ids = Vec::new();
        for title in &titles {
            let description = format!("Source: visor-auto\nOrigin channel: {channel_id}");
            let task = self
                .projects
                .create_task(&project.id, title, &description, TaskPriority::Medium, None)
                .await?;
            task_ids.push(task.id);
        }

        let bulletin = Bulletin {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            channel_id: channel_id.to_string(),
            content: format!(
                "{} task(s) added to the backlog of project {}",
                task_ids.len(),
                project.name
            ),
            task_ids: task_ids.clone(),
            created_at: Utc::now(),
        };

        self.store
            .append(EventEnvelope::new(
                channel_id,
                uuid::Uuid::new_v4().to_string(),
                MessageBody::VisorBulletinGenerated {
                    bulletin: bulletin.content.clone(),
                    task_ids,
                    extra: serde_json::Map::new(),
                },
            ))
            .await?;

        self.bulletins.write().await.push(bulletin);
        Ok(())
    }

    /// Approval: `pick up #N` (1-based within the current backlog) or a
    /// literal task id. Out-of-range references are ignored.
    async fn approve(&self, project_id: &str, reference: ApprovalRef) -> Result<()> {
        let task = match reference {
            ApprovalRef::Index(index) => {
                let backlog: Vec<Task> = self
                    .projects
                    .list_tasks(project_id)
                    .await?
                    .into_iter()
                    .filter(|task| task.status == TaskStatus::Backlog)
                    .collect();
                if index == 0 || index > backlog.len() {
                    tracing::info!(project_id, index, "approval index out of range, ignoring");
                    return Ok(());
                }
                backlog[index - 1].clone()
            }
            ApprovalRef::Id(id) => match self.projects.get_task(&id).await? {
                Some(task) if task.project_id == project_id => task,
                _ => {
                    tracing::info!(project_id, task_id = %id, "approval target unknown, ignoring");
                    return Ok(());
                }
            },
        };

        if task.status != TaskStatus::Backlog {
            tracing::info!(task_id = %task.id, status = %task.status, "approval on non-backlog task, ignoring");
            return Ok(());
        }

        self.projects
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Ready),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(task_id = %task.id, "task approved to ready");
        Ok(())
    }

    /// Ready-task binding pass: claim (when the board permits) and spawn a
    /// worker, then move the task to `in_progress`.
    pub async fn bind_ready_tasks(&self) -> Result<()> {
        let ready = self.projects.tasks_in_status(TaskStatus::Ready).await?;
        for task in ready {
            if let Err(error) = self.bind_one(&task).await {
                tracing::warn!(task_id = %task.id, %error, "failed to bind ready task");
            }
        }
        Ok(())
    }

    async fn bind_one(&self, task: &Task) -> Result<()> {
        let config = self.config.load();

        let (claimed_actor_id, claimed_agent_id) = match &task.actor_id {
            Some(actor_id) => {
                let board = self.board.get().await?;
                if !may_claim_actor(&board, actor_id) {
                    // Stall at ready with no claim: the board does not permit
                    // dispatcher -> actor over task links.
                    return Ok(());
                }
                let agent_id = board
                    .node(actor_id)
                    .and_then(|node| node.agent_id.clone())
                    .unwrap_or_else(|| config.default_agent_id.clone());
                (Some(actor_id.clone()), Some(agent_id))
            }
            None => (None, None),
        };

        let project = self.projects.require_project(&task.project_id).await?;
        let channel_id = task
            .origin_channel()
            .map(str::to_string)
            .or_else(|| project.channels.first().map(|channel| channel.id.clone()))
            .unwrap_or_else(|| format!("project:{}", project.id));

        let agent_id = claimed_agent_id
            .clone()
            .unwrap_or_else(|| config.default_agent_id.clone());

        let worker_id = self
            .scheduler
            .spawn(WorkerSpec {
                channel_id,
                agent_id,
                task_id: Some(task.id.clone()),
                title: task.title.clone(),
                objective: if task.description.is_empty() {
                    task.title.clone()
                } else {
                    format!("{}\n\n{}", task.title, task.description)
                },
                tools: Vec::new(),
                mode: WorkerMode::Interactive,
            })
            .await?;

        self.projects
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::InProgress),
                    claimed_actor_id: Some(claimed_actor_id),
                    claimed_agent_id: Some(claimed_agent_id),
                    ..Default::default()
                },
            )
            .await?;

        self.task_log(
            &task.project_id,
            &task.id,
            "worker_spawned",
            &format!("worker_id={worker_id}"),
        )
        .await;
        self.task_log(&task.project_id, &task.id, "status_synced", "status=in_progress")
            .await;
        Ok(())
    }

    /// `worker.completed` → artifact + `done`.
    async fn on_worker_completed(
        &self,
        task_id: &str,
        worker_id: WorkerId,
        report: &str,
    ) -> Result<()> {
        let Some(task) = self.projects.get_task(task_id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::InProgress {
            return Ok(());
        }

        let suffix = &worker_id.to_string()[..8];
        let record = self
            .artifacts
            .store(
                &Path::new("projects").join(&task.project_id).join("artifacts"),
                &format!("task-{task_id}-{suffix}.md"),
                report.as_bytes(),
            )
            .await?;

        self.projects
            .append_description_line(task_id, &format!("Artifact: {}", record.relative_path))
            .await?;
        self.projects
            .update_task(
                task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .await?;

        self.task_log(&task.project_id, task_id, "completed", &format!("worker_id={worker_id}"))
            .await;
        self.task_log(&task.project_id, task_id, "status_synced", "status=done")
            .await;
        tracing::info!(task_id, worker_id = %worker_id, "task completed by worker");
        Ok(())
    }

    /// `worker.failed` → rewind to `backlog` with the failure note.
    async fn on_worker_failed(&self, task_id: &str, reason: &str) -> Result<()> {
        let Some(task) = self.projects.get_task(task_id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::InProgress {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        self.projects
            .append_description_line(task_id, &format!("Worker failed at {now}"))
            .await?;
        self.projects
            .update_task(
                task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Backlog),
                    claimed_actor_id: Some(None),
                    claimed_agent_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        self.task_log(&task.project_id, task_id, "failed", &format!("reason={reason}"))
            .await;
        self.task_log(&task.project_id, task_id, "status_synced", "status=backlog")
            .await;
        tracing::warn!(task_id, reason, "task rewound to backlog after worker failure");
        Ok(())
    }

    /// Append one `stage=<name> ts=<iso8601> …` line to the per-task log.
    async fn task_log(&self, project_id: &str, task_id: &str, stage: &str, extra: &str) {
        let logs_dir = self.config.load().project_dir(project_id).join("logs");
        if let Err(error) = tokio::fs::create_dir_all(&logs_dir).await {
            tracing::warn!(%error, "failed to create task log dir");
            return;
        }
        let path = logs_dir.join(format!("task-{task_id}.log"));
        let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let line = format!("stage={stage} ts={ts} {extra}\n");

        let result = async {
            use tokio::io::AsyncWriteExt as _;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;
        if let Err(error) = result {
            tracing::warn!(%error, path = %path.display(), "failed to append task log");
        }
    }

    /// Retained bulletins, newest last.
    pub async fn bulletins(&self) -> Vec<Bulletin> {
        self.bulletins.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::types::{ActorKind, ActorLink, ActorNode, CommunicationType, LinkDirection};
    use crate::config::RuntimeConfig;
    use crate::llm::LlmManager;
    use crate::persist::MemoryBackend;
    use crate::projects::store::ProjectChannel;
    use crate::tools::{AgentToolsPolicy, PolicyService};

    struct Fixture {
        visor: Arc<Visor>,
        projects: Arc<ProjectStore>,
        board: Arc<BoardStore>,
        scheduler: Arc<WorkerScheduler>,
        store: Arc<EventStore>,
        config: Arc<ConfigHandle>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut runtime_config = RuntimeConfig::default();
        runtime_config.workspace_root = dir.path().to_path_buf();
        let config = ConfigHandle::new(runtime_config);
        let backend = MemoryBackend::new();
        let store = Arc::new(EventStore::new(backend.clone(), config.clone()));
        let llm = Arc::new(LlmManager::new(config.clone()));
        let policy = Arc::new(PolicyService::new(config.clone()));
        policy
            .write_policy("overlord", &AgentToolsPolicy::scaffold())
            .expect("policy");
        let scheduler = Arc::new(WorkerScheduler::new(
            store.clone(),
            backend.clone(),
            llm,
            policy,
        ));
        let projects = Arc::new(ProjectStore::new(backend.clone()));
        let board = Arc::new(BoardStore::new(backend.clone()));
        let artifacts = Arc::new(ArtifactStore::new(dir.path().to_path_buf(), backend));
        let visor = Arc::new(Visor::new(
            projects.clone(),
            board.clone(),
            scheduler.clone(),
            store.clone(),
            artifacts,
            config.clone(),
        ));
        Fixture {
            visor,
            projects,
            board,
            scheduler,
            store,
            config,
            _dir: dir,
        }
    }

    async fn seed_project(fixture: &Fixture) -> crate::projects::Project {
        fixture
            .projects
            .create_project(
                "migration",
                "",
                vec![ProjectChannel {
                    id: "general".into(),
                    title: "General".into(),
                }],
            )
            .await
            .expect("project")
    }

    #[test]
    fn extraction_covers_the_listed_forms() {
        let content = indoc::indoc! {"
            - [ ] Prepare migration plan
            TODO: prepare migration plan
            нужно проверить бэкапы
            please prepare the rollout checklist
            unrelated chatter
        "};
        let titles = extract_todos(content);
        assert_eq!(
            titles,
            vec![
                "Prepare migration plan".to_string(),
                "prepare migration plan".to_string(),
                "проверить бэкапы".to_string(),
                "please prepare the rollout checklist".to_string(),
            ]
        );
    }

    #[test]
    fn dedup_is_case_sensitive_on_normalized_titles() {
        let titles = extract_todos("- [ ] ship  it\n- [ ] ship it.\nTODO: Ship it");
        assert_eq!(titles, vec!["ship it".to_string(), "Ship it".to_string()]);
    }

    #[test]
    fn approval_parsing() {
        assert_eq!(parse_approval("pick up #2"), Some(ApprovalRef::Index(2)));
        assert_eq!(
            parse_approval("Pick Up  # 14 please"),
            Some(ApprovalRef::Index(14))
        );
        assert_eq!(
            parse_approval("pick up #9b2e4f6a-1c3d-4e5f-8a9b-0c1d2e3f4a5b"),
            Some(ApprovalRef::Id("9b2e4f6a-1c3d-4e5f-8a9b-0c1d2e3f4a5b".into()))
        );
        assert_eq!(parse_approval("pick up the phone"), None);
    }

    #[tokio::test]
    async fn message_on_project_channel_creates_backlog_tasks() {
        let fixture = fixture();
        let project = seed_project(&fixture).await;

        fixture
            .visor
            .on_message(
                "general",
                "- [ ] Prepare migration plan\nTODO: prepare migration plan",
            )
            .await
            .expect("visor");

        let tasks = fixture.projects.list_tasks(&project.id).await.expect("tasks");
        assert!(tasks.len() >= 2);
        for task in &tasks {
            assert_eq!(task.status, TaskStatus::Backlog);
            assert!(task.description.contains("Source: visor-auto"));
            assert!(task.description.contains("Origin channel: general"));
        }

        // A bulletin was generated and logged.
        assert_eq!(fixture.visor.bulletins().await.len(), 1);
        let stored = fixture.store.read("general", 1).await.unwrap();
        assert!(stored
            .iter()
            .any(|item| item.envelope.message_type() == "visor.bulletin.generated"));
    }

    #[tokio::test]
    async fn message_outside_any_project_is_skipped() {
        let fixture = fixture();
        seed_project(&fixture).await;

        fixture
            .visor
            .on_message("random", "- [ ] should not appear")
            .await
            .expect("visor");

        let projects = fixture.projects.list_projects().await.expect("projects");
        let tasks = fixture
            .projects
            .list_tasks(&projects[0].id)
            .await
            .expect("tasks");
        assert!(tasks.is_empty());
        assert!(fixture.visor.bulletins().await.is_empty());
    }

    #[tokio::test]
    async fn approval_by_index_moves_second_backlog_task_to_ready() {
        let fixture = fixture();
        let project = seed_project(&fixture).await;
        let _first = fixture
            .projects
            .create_task(&project.id, "first", "", TaskPriority::Medium, None)
            .await
            .expect("task");
        let second = fixture
            .projects
            .create_task(&project.id, "second", "", TaskPriority::Medium, None)
            .await
            .expect("task");

        fixture
            .visor
            .on_message("general", "pick up #2")
            .await
            .expect("visor");

        let task = fixture.projects.require_task(&second.id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn approval_out_of_range_has_no_effect() {
        let fixture = fixture();
        let project = seed_project(&fixture).await;
        let task = fixture
            .projects
            .create_task(&project.id, "only", "", TaskPriority::Medium, None)
            .await
            .expect("task");

        fixture
            .visor
            .on_message("general", "pick up #5")
            .await
            .expect("visor");

        let task = fixture.projects.require_task(&task.id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Backlog);
    }

    #[tokio::test]
    async fn ready_task_binds_and_spawns_a_worker() {
        let fixture = fixture();
        let project = seed_project(&fixture).await;
        let task = fixture
            .projects
            .create_task(
                &project.id,
                "write plan",
                "Source: visor-auto\nOrigin channel: general",
                TaskPriority::Medium,
                None,
            )
            .await
            .expect("task");
        fixture
            .projects
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Ready),
                    ..Default::default()
                },
            )
            .await
            .expect("ready");

        fixture.visor.bind_ready_tasks().await.expect("bind");

        let task = fixture.projects.require_task(&task.id).await.expect("task");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.claimed_actor_id.is_none());

        let workers = fixture.scheduler.list().await.expect("workers");
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(workers[0].channel_id, "general");

        // The per-task log recorded the spawn.
        let log_path = fixture
            .config
            .load()
            .project_dir(&project.id)
            .join("logs")
            .join(format!("task-{}.log", task.id));
        let log = tokio::fs::read_to_string(&log_path).await.expect("task log");
        assert!(log.contains("stage=worker_spawned"));
        assert!(log.contains("stage=status_synced"));
    }

    #[tokio::test]
    async fn named_actor_without_board_permission_stalls_at_ready() {
        let fixture = fixture();
        let project = seed_project(&fixture).await;
        let task = fixture
            .projects
            .create_task(
                &project.id,
                "guarded",
                "",
                TaskPriority::Medium,
                Some("agent:scribe".into()),
            )
            .await
            .expect("task");
        fixture
            .projects
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Ready),
                    ..Default::default()
                },
            )
            .await
            .expect("ready");

        fixture.visor.bind_ready_tasks().await.expect("bind");
        let stalled = fixture.projects.require_task(&task.id).await.expect("task");
        assert_eq!(stalled.status, TaskStatus::Ready);
        assert!(stalled.claimed_actor_id.is_none());
        assert!(stalled.claimed_agent_id.is_none());

        // Permit dispatcher -> scribe over task links; the next pass claims.
        let mut board = fixture.board.get().await.expect("board");
        board.nodes.push(ActorNode {
            id: "agent:scribe".into(),
            kind: ActorKind::Agent,
            label: "Scribe".into(),
            agent_id: Some("overlord".into()),
        });
        board.links.push(ActorLink {
            source: "human:dispatcher".into(),
            target: "agent:scribe".into(),
            direction: LinkDirection::OneWay,
            communication_type: CommunicationType::Task,
            source_socket: None,
            target_socket: None,
        });
        fixture.board.put(board).await.expect("board");

        fixture.visor.bind_ready_tasks().await.expect("bind");
        let claimed = fixture.projects.require_task(&task.id).await.expect("task");
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.claimed_actor_id.as_deref(), Some("agent:scribe"));
        assert_eq!(claimed.claimed_agent_id.as_deref(), Some("overlord"));
    }

    #[tokio::test]
    async fn worker_failure_rewinds_task_to_backlog() {
        let fixture = fixture();
        let project = seed_project(&fixture).await;
        let task = fixture
            .projects
            .create_task(&project.id, "doomed", "", TaskPriority::Medium, None)
            .await
            .expect("task");
        for status in [TaskStatus::Ready, TaskStatus::InProgress] {
            fixture
                .projects
                .update_task(
                    &task.id,
                    TaskUpdate {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await
                .expect("transition");
        }

        fixture
            .visor
            .on_worker_failed(&task.id, "interrupt")
            .await
            .expect("failed sync");

        let task = fixture.projects.require_task(&task.id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert!(task.description.contains("Worker failed at "));
    }

    #[tokio::test]
    async fn worker_completion_finishes_task_with_artifact() {
        let fixture = fixture();
        let project = seed_project(&fixture).await;
        let task = fixture
            .projects
            .create_task(&project.id, "deliver", "", TaskPriority::Medium, None)
            .await
            .expect("task");
        for status in [TaskStatus::Ready, TaskStatus::InProgress] {
            fixture
                .projects
                .update_task(
                    &task.id,
                    TaskUpdate {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await
                .expect("transition");
        }

        let worker_id = uuid::Uuid::new_v4();
        fixture
            .visor
            .on_worker_completed(&task.id, worker_id, "final report body")
            .await
            .expect("completed sync");

        let task = fixture.projects.require_task(&task.id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Done);
        let artifact_line = task
            .description
            .lines()
            .find(|line| line.starts_with("Artifact: "))
            .expect("artifact reference recorded");
        let relative = artifact_line.strip_prefix("Artifact: ").unwrap();
        assert!(relative.contains(&format!("task-{}-", task.id)));
        assert!(fixture
            .config
            .load()
            .workspace_root
            .join(relative)
            .is_file());
    }
}
