//! Visor bulletins feed.

use super::state::ApiState;
use super::ApiResult;
use crate::projects::Bulletin;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct BulletinListResponse {
    bulletins: Vec<Bulletin>,
}

pub(super) async fn list_bulletins(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<BulletinListResponse> {
    let bulletins = state.runtime.visor.bulletins().await;
    Ok(Json(BulletinListResponse { bulletins }))
}
