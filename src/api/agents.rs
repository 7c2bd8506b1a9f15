//! Agent registry endpoints.

use super::state::ApiState;
use super::{error_response, ApiResult};
use crate::identity::{Agent, AgentConfigFile};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct AgentListResponse {
    agents: Vec<Agent>,
}

pub(super) async fn list_agents(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<AgentListResponse> {
    let agents = state.runtime.agents.list().await.map_err(error_response)?;
    Ok(Json(AgentListResponse { agents }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateAgentBody {
    id: String,
    display_name: String,
    #[serde(default)]
    role: Option<String>,
}

pub(super) async fn create_agent(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateAgentBody>,
) -> std::result::Result<(StatusCode, Json<Agent>), super::ApiError> {
    let agent = state
        .runtime
        .agents
        .create(
            &body.id,
            &body.display_name,
            body.role.as_deref().unwrap_or("assistant"),
        )
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub(super) async fn get_agent(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Agent> {
    let agent = state
        .runtime
        .agents
        .require(&agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(agent))
}

pub(super) async fn get_agent_config(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<AgentConfigFile> {
    let config = state
        .runtime
        .agents
        .read_config(&agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(config))
}

pub(super) async fn update_agent_config(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    Json(config): Json<AgentConfigFile>,
) -> ApiResult<AgentConfigFile> {
    state
        .runtime
        .agents
        .write_config(&agent_id, &config)
        .await
        .map_err(error_response)?;
    Ok(Json(config))
}
