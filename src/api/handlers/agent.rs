//! Agent binary serving, self-update, and status.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{AgentStatus, Server};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/binary", get(get_binary))
        .route("/update/{server_id}", post(update_agent))
        .route("/status/{server_id}", get(get_status))
}

/// Serve the current agent binary. Agents download it here during
/// self-update; the deployer pushes it over SFTP instead.
#[utoipa::path(
    get,
    path = "/binary",
    context_path = "/api/agent",
    tag = "agent",
    responses(
        (status = 200, description = "Agent binary stream", content_type = "application/octet-stream"),
        (status = 404, description = "Binary not present on the controller"),
    )
)]
async fn get_binary(State(state): State<SharedState>) -> Result<impl IntoResponse> {
    let binary_path = &state.config.agent_binary_path;
    if !binary_path.exists() {
        return Err(AppError::NotFound(format!(
            "Agent binary not found at {}",
            binary_path.display()
        )));
    }

    let file = tokio::fs::File::open(binary_path).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"backup-agent\"",
            ),
        ],
        body,
    ))
}

/// Command a connected agent to fetch a fresh binary and restart. The
/// server rides out the reconnect gap in the `updating` state.
#[utoipa::path(
    post,
    path = "/update/{server_id}",
    context_path = "/api/agent",
    tag = "agent",
    responses(
        (status = 200, description = "Update command sent"),
        (status = 404, description = "Unknown server"),
        (status = 503, description = "Agent not connected"),
    )
)]
async fn update_agent(
    State(state): State<SharedState>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>> {
    if Server::find_by_id(&state.db, &server_id).await?.is_none() {
        return Err(AppError::NotFound("Server not found".into()));
    }
    if !state.agents.is_connected(&server_id) {
        return Err(AppError::AgentUnavailable("Agent is not connected".into()));
    }

    let sent = state.agents.send(
        &server_id,
        "agent:update",
        json!({
            "download_path": "/api/agent/binary",
            "version": "latest",
        }),
    );
    if !sent {
        return Err(AppError::AgentUnavailable(
            "Failed to send update command".into(),
        ));
    }

    Server::set_agent_status(&state.db, &server_id, AgentStatus::Updating).await?;
    tracing::info!(server_id = %server_id, "Agent self-update initiated");
    Ok(Json(json!({ "status": "update_initiated" })))
}

#[utoipa::path(
    get,
    path = "/status/{server_id}",
    context_path = "/api/agent",
    tag = "agent",
    responses(
        (status = 200, description = "Live and persisted agent state"),
        (status = 404, description = "Unknown server"),
    )
)]
async fn get_status(
    State(state): State<SharedState>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>> {
    let server = Server::find_by_id(&state.db, &server_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Server not found".into()))?;

    Ok(Json(json!({
        "connected": state.agents.is_connected(&server_id),
        "agent_status": server.agent_status,
        "agent_version": server.agent_version,
        "agent_last_seen": server.agent_last_seen,
    })))
}

#[derive(utoipa::OpenApi)]
#[openapi(paths(get_binary, update_agent, get_status))]
pub struct AgentApiDoc;
