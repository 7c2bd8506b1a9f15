//! Runtime config: read and hot-reload.

use super::state::ApiState;
use super::ApiResult;
use crate::config::RuntimeConfig;

use axum::extract::State;
use axum::Json;
use std::sync::Arc;

pub(super) async fn get_config(State(state): State<Arc<ApiState>>) -> ApiResult<RuntimeConfig> {
    Ok(Json((*state.runtime.config.load()).clone()))
}

/// PUT swaps the snapshot atomically and hot-reloads the model provider.
pub(super) async fn update_config(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<RuntimeConfig>,
) -> ApiResult<RuntimeConfig> {
    state.runtime.config.store(config.clone());
    state.runtime.llm.reload(&config.provider);
    tracing::info!("runtime config updated");
    Ok(Json(config))
}
