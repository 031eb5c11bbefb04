//! Server management endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::server::{CreateServerRequest, UpdateServerRequest};
use crate::models::{Job, Server};
use crate::services::deployer_service::{self, DeployOptions};
use crate::services::ping_service::PingStatus;
use crate::ws::agent::REQUEST_TIMEOUT;
use crate::ws::EventType;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_servers).post(create_server))
        .route("/ping-status", get(ping_status))
        .route(
            "/{id}",
            get(get_server).put(update_server).delete(delete_server),
        )
        .route("/{id}/explore", get(explore))
}

#[utoipa::path(
    get,
    path = "/",
    context_path = "/api/servers",
    tag = "servers",
    responses((status = 200, description = "All managed servers", body = [Server]))
)]
async fn list_servers(State(state): State<SharedState>) -> Result<Json<Vec<Server>>> {
    Ok(Json(Server::find_all(&state.db).await?))
}

#[utoipa::path(
    get,
    path = "/{id}",
    context_path = "/api/servers",
    tag = "servers",
    responses(
        (status = 200, description = "Server detail", body = Server),
        (status = 404, description = "Unknown server"),
    )
)]
async fn get_server(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Server>> {
    Server::find_by_id(&state.db, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Server not found".into()))
}

/// Create a server. When a password is supplied the agent is deployed over
/// SSH in the same request; a deploy failure rolls the row back and returns
/// 422 so the operator sees one atomic outcome.
#[utoipa::path(
    post,
    path = "/",
    context_path = "/api/servers",
    tag = "servers",
    request_body = CreateServerRequest,
    responses(
        (status = 201, description = "Server created (and agent deployed)", body = Server),
        (status = 400, description = "Missing fields"),
        (status = 422, description = "Agent deployment failed"),
    )
)]
async fn create_server(
    State(state): State<SharedState>,
    Json(body): Json<CreateServerRequest>,
) -> Result<(StatusCode, Json<Server>)> {
    if body.name.is_empty() || body.hostname.is_empty() {
        return Err(AppError::Validation("name and hostname are required".into()));
    }

    let server = Server::create(&state.db, &body).await?;

    if let Some(password) = body.password.filter(|p| !p.is_empty()) {
        let opts = DeployOptions {
            hostname: body.hostname.clone(),
            port: body.port as u16,
            username: body.ssh_user.clone(),
            password,
            server_id: server.id.clone(),
            controller_port: state.config.port,
            fallback_ip: state.config.backup_server_ip.clone(),
            binary_path: state.config.agent_binary_path.clone(),
        };

        if let Err(e) = deployer_service::deploy_agent(opts, state.agents.clone()).await {
            tracing::error!(hostname = %body.hostname, error = %e, "Agent deployment failed");
            let _ = Server::delete(&state.db, &server.id).await;
            return Err(AppError::Unprocessable(e.to_string()));
        }
    }

    let server = Server::find_by_id(&state.db, &server.id)
        .await?
        .ok_or_else(|| AppError::Internal("Server disappeared during deploy".into()))?;
    state
        .ui
        .broadcast(EventType::ServerCreated, json!({ "server": server }));
    Ok((StatusCode::CREATED, Json(server)))
}

#[utoipa::path(
    put,
    path = "/{id}",
    context_path = "/api/servers",
    tag = "servers",
    request_body = UpdateServerRequest,
    responses(
        (status = 200, description = "Updated server", body = Server),
        (status = 404, description = "Unknown server"),
    )
)]
async fn update_server(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateServerRequest>,
) -> Result<Json<Server>> {
    let server = Server::update(&state.db, &id, &body)
        .await?
        .ok_or_else(|| AppError::NotFound("Server not found".into()))?;
    state
        .ui
        .broadcast(EventType::ServerUpdated, json!({ "server": server }));
    Ok(Json(server))
}

/// Delete a server. Jobs, logs, and versions cascade in the database; any
/// running job is cancelled and its schedule dropped first.
#[utoipa::path(
    delete,
    path = "/{id}",
    context_path = "/api/servers",
    tag = "servers",
    responses(
        (status = 204, description = "Server deleted"),
        (status = 404, description = "Unknown server"),
    )
)]
async fn delete_server(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let jobs = Job::find_by_server(&state.db, &id).await?;
    for job in &jobs {
        if state.orchestrator.is_running(&job.id) {
            let _ = state.orchestrator.cancel(&job.id).await;
        }
        state.scheduler.unschedule(&job.id);
    }

    if !Server::delete(&state.db, &id).await? {
        return Err(AppError::NotFound("Server not found".into()));
    }
    state
        .ui
        .broadcast(EventType::ServerDeleted, json!({ "serverId": id }));
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/ping-status",
    context_path = "/api/servers",
    tag = "servers",
    responses((status = 200, description = "In-memory reachability snapshot", body = [PingStatus]))
)]
async fn ping_status(State(state): State<SharedState>) -> Json<Vec<PingStatus>> {
    Json(state.ping.snapshot())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExploreQuery {
    pub path: Option<String>,
}

/// Browse the remote filesystem through the agent (`fs:browse` RPC).
#[utoipa::path(
    get,
    path = "/{id}/explore",
    context_path = "/api/servers",
    tag = "servers",
    params(("path" = Option<String>, Query, description = "Remote path, defaults to /")),
    responses(
        (status = 200, description = "Remote directory entries"),
        (status = 404, description = "Unknown server or remote path"),
        (status = 503, description = "Agent not connected"),
    )
)]
async fn explore(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ExploreQuery>,
) -> Result<Json<Value>> {
    let remote_path = query.path.unwrap_or_else(|| "/".into());

    if Server::find_by_id(&state.db, &id).await?.is_none() {
        return Err(AppError::NotFound("Server not found".into()));
    }
    if !state.agents.is_connected(&id) {
        return Err(AppError::AgentUnavailable("Agent is not connected".into()));
    }

    let response = state
        .agents
        .request(&id, "fs:browse", json!({ "path": remote_path }), REQUEST_TIMEOUT)
        .await?;

    if let Some(error) = response.get("error").and_then(|e| e.as_str()) {
        if error.contains("No such file") || error.contains("not found") {
            return Err(AppError::NotFound(format!("Path not found: {}", remote_path)));
        }
        if error.contains("Permission denied") || error.contains("EACCES") {
            return Err(AppError::Forbidden(format!("Permission denied: {}", remote_path)));
        }
        return Err(AppError::AgentRequest(error.to_string()));
    }

    Ok(Json(response.get("entries").cloned().unwrap_or(json!([]))))
}

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(list_servers, get_server, create_server, update_server, delete_server, ping_status, explore),
    components(schemas(Server, CreateServerRequest, UpdateServerRequest, PingStatus))
)]
pub struct ServersApiDoc;
