//! Provider catalog and key status.

use super::state::ApiState;
use super::{error_response, ApiResult};
use crate::llm::manager::ProviderStatus;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct ModelsResponse {
    models: Vec<String>,
}

pub(super) async fn list_models(State(state): State<Arc<ApiState>>) -> ApiResult<ModelsResponse> {
    let models = state
        .runtime
        .llm
        .list_remote_models()
        .await
        .map_err(error_response)?;
    Ok(Json(ModelsResponse { models }))
}

pub(super) async fn provider_status(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<ProviderStatus> {
    Ok(Json(state.runtime.llm.status()))
}
