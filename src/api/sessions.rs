//! Agent session endpoints, including the SSE stream.

use super::state::ApiState;
use super::{bad_request, error_response, ApiResult};
use crate::sessions::{
    AgentSessionEvent, AgentSessionSummary, AttachmentUpload, RunControlAction, StreamUpdate,
};

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct SessionListResponse {
    sessions: Vec<AgentSessionSummary>,
}

pub(super) async fn list_sessions(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<SessionListResponse> {
    let sessions = state
        .runtime
        .sessions
        .list(&agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(SessionListResponse { sessions }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    parent_session_id: Option<String>,
}

#[derive(Serialize)]
pub(super) struct SessionCreatedResponse {
    session: AgentSessionSummary,
    events: Vec<AgentSessionEvent>,
}

pub(super) async fn create_session(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    body: Option<Json<CreateSessionBody>>,
) -> std::result::Result<(axum::http::StatusCode, Json<SessionCreatedResponse>), super::ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let (session, events) = state
        .runtime
        .sessions
        .create_session(&agent_id, body.title, body.parent_session_id)
        .await
        .map_err(error_response)?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(SessionCreatedResponse { session, events }),
    ))
}

#[derive(Serialize)]
pub(super) struct SessionDetailResponse {
    session: AgentSessionSummary,
    events: Vec<AgentSessionEvent>,
}

pub(super) async fn session_detail(
    State(state): State<Arc<ApiState>>,
    Path((agent_id, session_id)): Path<(String, String)>,
) -> ApiResult<SessionDetailResponse> {
    let session = state
        .runtime
        .sessions
        .get(&agent_id, &session_id)
        .await
        .map_err(error_response)?;
    let events = state
        .runtime
        .sessions
        .events(&agent_id, &session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(SessionDetailResponse { session, events }))
}

#[derive(Serialize)]
pub(super) struct DeletedResponse {
    deleted: bool,
}

pub(super) async fn delete_session(
    State(state): State<Arc<ApiState>>,
    Path((agent_id, session_id)): Path<(String, String)>,
) -> ApiResult<DeletedResponse> {
    state
        .runtime
        .sessions
        .delete(&agent_id, &session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(DeletedResponse { deleted: true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PostMessageBody {
    content: String,
    #[serde(default)]
    attachments: Vec<AttachmentUpload>,
}

#[derive(Serialize)]
pub(super) struct PostMessageResponse {
    events: Vec<AgentSessionEvent>,
    decision: crate::agent::RouteDecision,
}

pub(super) async fn post_message(
    State(state): State<Arc<ApiState>>,
    Path((agent_id, session_id)): Path<(String, String)>,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<PostMessageResponse> {
    let (events, decision) = state
        .runtime
        .sessions
        .post_message(&agent_id, &session_id, &body.content, body.attachments)
        .await
        .map_err(error_response)?;
    Ok(Json(PostMessageResponse { events, decision }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ControlBody {
    action: String,
    requested_by: String,
    #[serde(default)]
    reason: Option<String>,
}

pub(super) async fn control_session(
    State(state): State<Arc<ApiState>>,
    Path((agent_id, session_id)): Path<(String, String)>,
    Json(body): Json<ControlBody>,
) -> ApiResult<AgentSessionEvent> {
    let action = match body.action.as_str() {
        "pause" => RunControlAction::Pause,
        "resume" => RunControlAction::Resume,
        "interrupt" => RunControlAction::Interrupt,
        other => return Err(bad_request(format!("unknown control action: {other}"))),
    };

    let event = state
        .runtime
        .sessions
        .control(&agent_id, &session_id, action, &body.requested_by, body.reason)
        .await
        .map_err(error_response)?;
    Ok(Json(event))
}

/// Server-sent events: `event: <kind>` then `data: <json>`, first event
/// `session_ready`.
pub(super) async fn stream_session(
    State(state): State<Arc<ApiState>>,
    Path((agent_id, session_id)): Path<(String, String)>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, super::ApiError>
{
    let mut rx = state
        .runtime
        .sessions
        .stream(&agent_id, &session_id)
        .await
        .map_err(error_response)?;

    let stream = async_stream::stream! {
        while let Some(update) = rx.recv().await {
            let StreamUpdate { kind, event } = update;
            let data = match &event {
                Some(event) => serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()),
                None => "{}".to_string(),
            };
            yield Ok(Event::default().event(kind.as_str()).data(data));
            if matches!(
                kind,
                crate::sessions::StreamKind::EndOfStream | crate::sessions::StreamKind::Lagging
            ) {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    ))
}
