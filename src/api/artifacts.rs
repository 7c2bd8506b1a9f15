//! Artifact byte retrieval.

use super::state::ApiState;
use super::{error_response, not_found};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use std::sync::Arc;

pub(super) async fn artifact_content(
    State(state): State<Arc<ApiState>>,
    Path(artifact_id): Path<String>,
) -> std::result::Result<impl IntoResponse, super::ApiError> {
    let bytes = state
        .runtime
        .artifacts
        .content(&artifact_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| not_found(format!("artifact {artifact_id} not found")))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}
