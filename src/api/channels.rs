//! Channel ingest, interactive worker routing, and state.

use super::state::ApiState;
use super::{bad_request, error_response, ApiResult};
use crate::agent::dispatcher::{IngestOutcome, IngestRequest};
use crate::events::ChannelSnapshot;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IngestBody {
    user_id: String,
    content: String,
    #[serde(default)]
    message_id: Option<String>,
}

pub(super) async fn ingest_message(
    State(state): State<Arc<ApiState>>,
    Path(channel_id): Path<String>,
    Json(body): Json<IngestBody>,
) -> ApiResult<IngestOutcome> {
    if body.user_id.is_empty() {
        return Err(bad_request("userId must not be empty"));
    }

    let outcome = state
        .runtime
        .dispatcher
        .ingest(
            &channel_id,
            IngestRequest {
                user_id: body.user_id,
                content: body.content,
                message_id: body.message_id,
            },
        )
        .await
        .map_err(error_response)?;

    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub(super) struct RouteBody {
    message: String,
}

#[derive(Serialize)]
pub(super) struct RouteResponse {
    report: String,
}

pub(super) async fn route_to_worker(
    State(state): State<Arc<ApiState>>,
    Path((channel_id, worker_id)): Path<(String, String)>,
    Json(body): Json<RouteBody>,
) -> ApiResult<RouteResponse> {
    let worker_id: uuid::Uuid = worker_id
        .parse()
        .map_err(|_| bad_request("workerId must be a UUID"))?;

    let report = state
        .runtime
        .dispatcher
        .route_to_worker(&channel_id, worker_id, &body.message)
        .await
        .map_err(error_response)?;

    Ok(Json(RouteResponse { report }))
}

/// Unknown channels return an empty snapshot, not 404.
pub(super) async fn channel_state(
    State(state): State<Arc<ApiState>>,
    Path(channel_id): Path<String>,
) -> ApiResult<ChannelSnapshot> {
    let snapshot = state
        .runtime
        .store
        .snapshot(&channel_id)
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot))
}
