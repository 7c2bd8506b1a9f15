//! HTTP server setup: router and API route wiring.

use super::state::ApiState;
use super::{agents, artifacts, board, bulletins, channels, config, projects, providers, sessions, workers};

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

/// Start the HTTP server on the given address.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/channels/{id}/messages", post(channels::ingest_message))
        .route(
            "/channels/{id}/route/{worker_id}",
            post(channels::route_to_worker),
        )
        .route("/channels/{id}/state", get(channels::channel_state))
        .route("/bulletins", get(bulletins::list_bulletins))
        .route(
            "/workers",
            get(workers::list_workers).post(workers::spawn_worker),
        )
        .route("/artifacts/{id}/content", get(artifacts::artifact_content))
        .route(
            "/agents",
            get(agents::list_agents).post(agents::create_agent),
        )
        .route("/agents/{id}", get(agents::get_agent))
        .route(
            "/agents/{id}/config",
            get(agents::get_agent_config).put(agents::update_agent_config),
        )
        .route(
            "/agents/{id}/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/agents/{id}/sessions/{sid}",
            get(sessions::session_detail).delete(sessions::delete_session),
        )
        .route(
            "/agents/{id}/sessions/{sid}/messages",
            post(sessions::post_message),
        )
        .route(
            "/agents/{id}/sessions/{sid}/control",
            post(sessions::control_session),
        )
        .route(
            "/agents/{id}/sessions/{sid}/stream",
            get(sessions::stream_session),
        )
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/{id}",
            get(projects::get_project)
                .put(projects::update_project)
                .delete(projects::delete_project),
        )
        .route(
            "/projects/{id}/tasks",
            get(projects::list_tasks).post(projects::create_task),
        )
        .route(
            "/projects/{id}/tasks/{task_id}",
            get(projects::get_task).patch(projects::update_task),
        )
        .route("/projects/{id}/channels", post(projects::add_channel))
        .route(
            "/actors/board",
            get(board::get_board).put(board::put_board),
        )
        .route("/actors/route", post(board::resolve_route))
        .route("/providers/openai/models", post(providers::list_models))
        .route("/providers/openai/status", get(providers::provider_status))
        .route(
            "/config",
            get(config::get_config).put(config::update_config),
        );

    let app = Router::new()
        .nest("/v1", v1)
        .route("/health", get(health))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|error| anyhow::anyhow!("failed to bind {bind}: {error}"))?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

async fn health() -> &'static str {
    "ok"
}
