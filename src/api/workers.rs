//! Worker listing and direct spawn.

use super::state::ApiState;
use super::{bad_request, error_response, ApiResult};
use crate::agent::worker::{Worker, WorkerMode, WorkerSpec};

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct WorkerListResponse {
    workers: Vec<Worker>,
}

pub(super) async fn list_workers(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<WorkerListResponse> {
    let workers = state
        .runtime
        .scheduler
        .list()
        .await
        .map_err(error_response)?;
    Ok(Json(WorkerListResponse { workers }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SpawnBody {
    channel_id: String,
    title: String,
    objective: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SpawnResponse {
    worker_id: String,
}

pub(super) async fn spawn_worker(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<SpawnBody>,
) -> std::result::Result<(StatusCode, Json<SpawnResponse>), super::ApiError> {
    let mode = match body.mode.as_deref() {
        None | Some("fire_and_forget") => WorkerMode::FireAndForget,
        Some("interactive") => WorkerMode::Interactive,
        Some(other) => return Err(bad_request(format!("unknown worker mode: {other}"))),
    };

    let agent_id = body
        .agent_id
        .unwrap_or_else(|| state.runtime.config.load().default_agent_id.clone());

    let worker_id = state
        .runtime
        .scheduler
        .spawn(WorkerSpec {
            channel_id: body.channel_id,
            agent_id,
            task_id: body.task_id,
            title: body.title,
            objective: body.objective,
            tools: body.tools,
            mode,
        })
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(SpawnResponse {
            worker_id: worker_id.to_string(),
        }),
    ))
}
