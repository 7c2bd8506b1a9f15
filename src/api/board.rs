//! Actor board CRUD and recipient resolution.

use super::state::ApiState;
use super::{bad_request, error_response, ApiResult};
use crate::board::{resolve, ActorBoard, CommunicationType};

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(super) async fn get_board(State(state): State<Arc<ApiState>>) -> ApiResult<ActorBoard> {
    let board = state.runtime.board.get().await.map_err(error_response)?;
    Ok(Json(board))
}

pub(super) async fn put_board(
    State(state): State<Arc<ApiState>>,
    Json(board): Json<ActorBoard>,
) -> ApiResult<ActorBoard> {
    let board = state.runtime.board.put(board).await.map_err(error_response)?;
    Ok(Json(board))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ResolveBody {
    from_actor_id: String,
    #[serde(default)]
    communication_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ResolveResponse {
    recipient_actor_ids: Vec<String>,
}

pub(super) async fn resolve_route(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<ResolveResponse> {
    let communication_type = match body.communication_type.as_deref() {
        None => None,
        Some(value) => Some(
            value
                .parse::<CommunicationType>()
                .map_err(|error| bad_request(error))?,
        ),
    };

    let board = state.runtime.board.get().await.map_err(error_response)?;
    let recipient_actor_ids = resolve(&board, &body.from_actor_id, communication_type);
    Ok(Json(ResolveResponse { recipient_actor_ids }))
}
