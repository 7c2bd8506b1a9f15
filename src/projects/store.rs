//! Project and task aggregates with the task state machine.

use crate::error::{Result, StoreError};
use crate::persist::{AggregateKind, Backend};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backlog" => Some(TaskStatus::Backlog),
            "ready" => Some(TaskStatus::Ready),
            "in_progress" => Some(TaskStatus::InProgress),
            "done" => Some(TaskStatus::Done),
            _ => None,
        }
    }

    /// The task lifecycle graph. `in_progress → backlog` is the worker
    /// failure rewind.
    pub fn can_transition_to(self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Backlog, Ready) | (Backlog, Done) | (Ready, InProgress) | (InProgress, Done)
                | (InProgress, Backlog)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A project-scoped channel binding: channel id → display title.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectChannel {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub channels: Vec<ProjectChannel>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    /// Multi-line; structured metadata lines (`Source: …`, `Origin channel:
    /// …`, `Artifact: …`, `Worker failed at …`) accumulate here.
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_agent_id: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The channel a worker for this task should report on, recovered from
    /// the `Origin channel:` metadata line.
    pub fn origin_channel(&self) -> Option<&str> {
        self.description
            .lines()
            .find_map(|line| line.strip_prefix("Origin channel: "))
            .map(str::trim)
    }
}

/// Field updates applied atomically to a task.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub status: Option<TaskStatus>,
    pub actor_id: Option<Option<String>>,
    pub claimed_actor_id: Option<Option<String>>,
    pub claimed_agent_id: Option<Option<String>>,
}

/// Store over the `projects` and `tasks` aggregates.
pub struct ProjectStore {
    backend: Arc<dyn Backend>,
}

impl ProjectStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    async fn persist_project(&self, project: &Project) -> Result<()> {
        self.backend
            .put_aggregate(
                AggregateKind::Projects,
                &project.id,
                serde_json::to_value(project).context("serialize project")?,
            )
            .await
    }

    async fn persist_task(&self, task: &Task) -> Result<()> {
        self.backend
            .put_aggregate(
                AggregateKind::Tasks,
                &task.id,
                serde_json::to_value(task).context("serialize task")?,
            )
            .await
    }

    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
        channels: Vec<ProjectChannel>,
    ) -> Result<Project> {
        let now = Utc::now();
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            channels,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.persist_project(&project).await?;
        tracing::info!(project_id = %project.id, name, "project created");
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let Some(body) = self.backend.get_aggregate(AggregateKind::Projects, id).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_value(body).ok())
    }

    pub async fn require_project(&self, id: &str) -> Result<Project> {
        self.get_project(id).await?.ok_or_else(|| {
            StoreError::AggregateNotFound {
                kind: "projects",
                id: id.to_string(),
            }
            .into()
        })
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = self.backend.list_aggregates(AggregateKind::Projects).await?;
        let mut projects: Vec<Project> = rows
            .into_iter()
            .filter_map(|(_, body)| serde_json::from_value(body).ok())
            .collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    pub async fn update_project(&self, mut project: Project) -> Result<Project> {
        project.version += 1;
        project.updated_at = Utc::now();
        self.persist_project(&project).await?;
        Ok(project)
    }

    pub async fn delete_project(&self, id: &str) -> Result<bool> {
        // Tasks of a deleted project go with it.
        for task in self.list_tasks(id).await? {
            self.backend
                .delete_aggregate(AggregateKind::Tasks, &task.id)
                .await?;
        }
        self.backend.delete_aggregate(AggregateKind::Projects, id).await
    }

    /// Add or retitle a project-scoped channel.
    pub async fn upsert_channel(
        &self,
        project_id: &str,
        channel_id: &str,
        title: &str,
    ) -> Result<Project> {
        let mut project = self.require_project(project_id).await?;
        match project
            .channels
            .iter_mut()
            .find(|channel| channel.id == channel_id)
        {
            Some(channel) => channel.title = title.to_string(),
            None => project.channels.push(ProjectChannel {
                id: channel_id.to_string(),
                title: title.to_string(),
            }),
        }
        self.update_project(project).await
    }

    /// The project whose `channels` contain `channel_id`, if any.
    pub async fn project_for_channel(&self, channel_id: &str) -> Result<Option<Project>> {
        Ok(self
            .list_projects()
            .await?
            .into_iter()
            .find(|project| project.channels.iter().any(|channel| channel.id == channel_id)))
    }

    pub async fn create_task(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        priority: TaskPriority,
        actor_id: Option<String>,
    ) -> Result<Task> {
        self.require_project(project_id).await?;
        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            priority,
            status: TaskStatus::Backlog,
            actor_id,
            team_id: None,
            claimed_actor_id: None,
            claimed_agent_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.persist_task(&task).await?;
        tracing::info!(project_id, task_id = %task.id, title, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let Some(body) = self.backend.get_aggregate(AggregateKind::Tasks, id).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_value(body).ok())
    }

    pub async fn require_task(&self, id: &str) -> Result<Task> {
        self.get_task(id).await?.ok_or_else(|| {
            StoreError::AggregateNotFound {
                kind: "tasks",
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Tasks of a project, oldest first. The 1-based backlog index used by
    /// approval commands follows this ordering, filtered to `backlog`.
    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let rows = self.backend.list_aggregates(AggregateKind::Tasks).await?;
        let mut tasks: Vec<Task> = rows
            .into_iter()
            .filter_map(|(_, body)| serde_json::from_value::<Task>(body).ok())
            .filter(|task| task.project_id == project_id)
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// All tasks in `status` across projects, oldest first.
    pub async fn tasks_in_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = self.backend.list_aggregates(AggregateKind::Tasks).await?;
        let mut tasks: Vec<Task> = rows
            .into_iter()
            .filter_map(|(_, body)| serde_json::from_value::<Task>(body).ok())
            .filter(|task| task.status == status)
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Apply `update` to a task. Status changes are validated against the
    /// lifecycle graph; anything else is a conflict.
    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        let mut task = self.require_task(id).await?;

        if let Some(status) = update.status
            && status != task.status
        {
            if !task.status.can_transition_to(status) {
                return Err(crate::error::AgentError::InvalidStateTransition(format!(
                    "task {id}: {} -> {}",
                    task.status, status
                ))
                .into());
            }
            task.status = status;
        }
        if let Some(title) = update.title {
            task.title = title;
        }
        if let Some(description) = update.description {
            task.description = description;
        }
        if let Some(priority) = update.priority {
            task.priority = priority;
        }
        if let Some(actor_id) = update.actor_id {
            task.actor_id = actor_id;
        }
        if let Some(claimed_actor_id) = update.claimed_actor_id {
            task.claimed_actor_id = claimed_actor_id;
        }
        if let Some(claimed_agent_id) = update.claimed_agent_id {
            task.claimed_agent_id = claimed_agent_id;
        }

        task.version += 1;
        task.updated_at = Utc::now();
        self.persist_task(&task).await?;
        Ok(task)
    }

    /// Append a metadata line to a task's description.
    pub async fn append_description_line(&self, id: &str, line: &str) -> Result<Task> {
        let task = self.require_task(id).await?;
        let description = if task.description.is_empty() {
            line.to_string()
        } else {
            format!("{}\n{line}", task.description)
        };
        self.update_task(
            id,
            TaskUpdate {
                description: Some(description),
                ..Default::default()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::persist::MemoryBackend;

    fn store() -> ProjectStore {
        ProjectStore::new(MemoryBackend::new())
    }

    async fn seed_project(store: &ProjectStore) -> Project {
        store
            .create_project(
                "migration",
                "storage migration",
                vec![ProjectChannel {
                    id: "general".into(),
                    title: "General".into(),
                }],
            )
            .await
            .expect("project")
    }

    #[test]
    fn lifecycle_graph_is_exact() {
        use TaskStatus::*;
        let allowed = [
            (Backlog, Ready),
            (Backlog, Done),
            (Ready, InProgress),
            (InProgress, Done),
            (InProgress, Backlog),
        ];
        for from in [Backlog, Ready, InProgress, Done] {
            for to in [Backlog, Ready, InProgress, Done] {
                if from == to {
                    continue;
                }
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[tokio::test]
    async fn task_status_transitions_are_validated() {
        let store = store();
        let project = seed_project(&store).await;
        let task = store
            .create_task(&project.id, "write plan", "", TaskPriority::Medium, None)
            .await
            .expect("task");

        // backlog -> in_progress skips ready: rejected.
        let error = store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::InProgress),
                    ..Default::default()
                },
            )
            .await
            .expect_err("invalid transition");
        assert_eq!(error.kind(), ErrorKind::Conflict);

        // The legal path works.
        for status in [TaskStatus::Ready, TaskStatus::InProgress, TaskStatus::Done] {
            store
                .update_task(
                    &task.id,
                    TaskUpdate {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await
                .expect("legal transition");
        }
    }

    #[tokio::test]
    async fn failure_rewind_returns_to_backlog() {
        let store = store();
        let project = seed_project(&store).await;
        let task = store
            .create_task(&project.id, "deploy", "", TaskPriority::High, None)
            .await
            .expect("task");

        for status in [TaskStatus::Ready, TaskStatus::InProgress, TaskStatus::Backlog] {
            store
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
        let task = store.require_task(&task.id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.version, 4);
    }

    #[tokio::test]
    async fn project_lookup_by_channel() {
        let store = store();
        let project = seed_project(&store).await;

        let found = store
            .project_for_channel("general")
            .await
            .expect("lookup")
            .expect("project bound to channel");
        assert_eq!(found.id, project.id);

        assert!(store
            .project_for_channel("random")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn origin_channel_reads_the_metadata_line() {
        let store = store();
        let project = seed_project(&store).await;
        let task = store
            .create_task(
                &project.id,
                "plan",
                "Source: visor-auto\nOrigin channel: general",
                TaskPriority::Medium,
                None,
            )
            .await
            .expect("task");
        assert_eq!(task.origin_channel(), Some("general"));
    }

    #[tokio::test]
    async fn delete_project_cascades_tasks() {
        let store = store();
        let project = seed_project(&store).await;
        let task = store
            .create_task(&project.id, "plan", "", TaskPriority::Low, None)
            .await
            .expect("task");

        assert!(store.delete_project(&project.id).await.expect("delete"));
        assert!(store.get_task(&task.id).await.expect("get").is_none());
    }
}
