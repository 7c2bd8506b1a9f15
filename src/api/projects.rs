//! Project and task endpoints.

use super::state::ApiState;
use super::{bad_request, error_response, not_found, ApiResult};
use crate::projects::{Project, ProjectChannel, Task, TaskPriority, TaskStatus, TaskUpdate};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct ProjectListResponse {
    projects: Vec<Project>,
}

pub(super) async fn list_projects(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<ProjectListResponse> {
    let projects = state
        .runtime
        .projects
        .list_projects()
        .await
        .map_err(error_response)?;
    Ok(Json(ProjectListResponse { projects }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateProjectBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    channels: Vec<ProjectChannel>,
}

pub(super) async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateProjectBody>,
) -> std::result::Result<(StatusCode, Json<Project>), super::ApiError> {
    let project = state
        .runtime
        .projects
        .create_project(&body.name, &body.description, body.channels)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Serialize)]
pub(super) struct ProjectDetailResponse {
    project: Project,
    tasks: Vec<Task>,
}

pub(super) async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> ApiResult<ProjectDetailResponse> {
    let project = state
        .runtime
        .projects
        .require_project(&project_id)
        .await
        .map_err(error_response)?;
    let tasks = state
        .runtime
        .projects
        .list_tasks(&project_id)
        .await
        .map_err(error_response)?;
    Ok(Json(ProjectDetailResponse { project, tasks }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateProjectBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub(super) async fn update_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
    Json(body): Json<UpdateProjectBody>,
) -> ApiResult<Project> {
    let mut project = state
        .runtime
        .projects
        .require_project(&project_id)
        .await
        .map_err(error_response)?;
    if let Some(name) = body.name {
        project.name = name;
    }
    if let Some(description) = body.description {
        project.description = description;
    }
    let project = state
        .runtime
        .projects
        .update_project(project)
        .await
        .map_err(error_response)?;
    Ok(Json(project))
}

#[derive(Serialize)]
pub(super) struct DeletedResponse {
    deleted: bool,
}

pub(super) async fn delete_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> ApiResult<DeletedResponse> {
    let deleted = state
        .runtime
        .projects
        .delete_project(&project_id)
        .await
        .map_err(error_response)?;
    if !deleted {
        return Err(not_found(format!("project {project_id} not found")));
    }
    Ok(Json(DeletedResponse { deleted }))
}

#[derive(Serialize)]
pub(super) struct TaskListResponse {
    tasks: Vec<Task>,
}

pub(super) async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> ApiResult<TaskListResponse> {
    state
        .runtime
        .projects
        .require_project(&project_id)
        .await
        .map_err(error_response)?;
    let tasks = state
        .runtime
        .projects
        .list_tasks(&project_id)
        .await
        .map_err(error_response)?;
    Ok(Json(TaskListResponse { tasks }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateTaskBody {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    actor_id: Option<String>,
}

pub(super) async fn create_task(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
    Json(body): Json<CreateTaskBody>,
) -> std::result::Result<(StatusCode, Json<Task>), super::ApiError> {
    let priority = match body.priority.as_deref() {
        None => TaskPriority::Medium,
        Some(value) => {
            TaskPriority::parse(value).ok_or_else(|| bad_request(format!("bad priority: {value}")))?
        }
    };
    let task = state
        .runtime
        .projects
        .create_task(&project_id, &body.title, &body.description, priority, body.actor_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub(super) async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path((project_id, task_id)): Path<(String, String)>,
) -> ApiResult<Task> {
    let task = state
        .runtime
        .projects
        .require_task(&task_id)
        .await
        .map_err(error_response)?;
    if task.project_id != project_id {
        return Err(not_found(format!("task {task_id} not found")));
    }
    Ok(Json(task))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateTaskBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    actor_id: Option<String>,
}

pub(super) async fn update_task(
    State(state): State<Arc<ApiState>>,
    Path((project_id, task_id)): Path<(String, String)>,
    Json(body): Json<UpdateTaskBody>,
) -> ApiResult<Task> {
    let current = state
        .runtime
        .projects
        .require_task(&task_id)
        .await
        .map_err(error_response)?;
    if current.project_id != project_id {
        return Err(not_found(format!("task {task_id} not found")));
    }

    let status = match body.status.as_deref() {
        None => None,
        Some(value) => {
            Some(TaskStatus::parse(value).ok_or_else(|| bad_request(format!("bad status: {value}")))?)
        }
    };
    let priority = match body.priority.as_deref() {
        None => None,
        Some(value) => Some(
            TaskPriority::parse(value).ok_or_else(|| bad_request(format!("bad priority: {value}")))?,
        ),
    };

    let task = state
        .runtime
        .projects
        .update_task(
            &task_id,
            TaskUpdate {
                title: body.title,
                description: body.description,
                priority,
                status,
                actor_id: body.actor_id.map(Some),
                ..Default::default()
            },
        )
        .await
        .map_err(error_response)?;
    Ok(Json(task))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AddChannelBody {
    channel_id: String,
    #[serde(default)]
    title: Option<String>,
}

pub(super) async fn add_channel(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
    Json(body): Json<AddChannelBody>,
) -> ApiResult<Project> {
    let title = body.title.unwrap_or_else(|| body.channel_id.clone());
    let project = state
        .runtime
        .projects
        .upsert_channel(&project_id, &body.channel_id, &title)
        .await
        .map_err(error_response)?;
    Ok(Json(project))
}
