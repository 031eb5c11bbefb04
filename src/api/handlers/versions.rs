//! Version management endpoints. Row deletes come first; filesystem cleanup
//! is asynchronous and allowed to lag.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::Version;
use crate::storage;
use crate::ws::EventType;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_versions))
        .route("/{id}", get(get_version).delete(delete_version))
        .route("/by-job/{job_id}", delete(delete_by_job))
        .route("/by-server/{server_id}", delete(delete_by_server))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VersionsQuery {
    pub job_id: Option<String>,
}

#[utoipa::path(
    get,
    path = "/",
    context_path = "/api/versions",
    tag = "versions",
    params(("job_id" = Option<String>, Query, description = "Filter by job")),
    responses((status = 200, description = "Versions, newest first", body = [Version]))
)]
async fn list_versions(
    State(state): State<SharedState>,
    Query(query): Query<VersionsQuery>,
) -> Result<Json<Vec<Version>>> {
    let versions = match query.job_id {
        Some(job_id) => Version::find_by_job(&state.db, &job_id).await?,
        None => Version::find_all(&state.db).await?,
    };
    Ok(Json(versions))
}

#[utoipa::path(
    get,
    path = "/{id}",
    context_path = "/api/versions",
    tag = "versions",
    responses(
        (status = 200, description = "Version detail", body = Version),
        (status = 404, description = "Unknown version"),
    )
)]
async fn get_version(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Version>> {
    Version::find_by_id(&state.db, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Version not found".into()))
}

#[utoipa::path(
    delete,
    path = "/{id}",
    context_path = "/api/versions",
    tag = "versions",
    responses(
        (status = 204, description = "Version deleted"),
        (status = 404, description = "Unknown version"),
    )
)]
async fn delete_version(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let version = Version::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound("Version not found".into()))?;

    Version::delete(&state.db, &id).await?;
    storage::spawn_remove_dir(version.local_path);

    state.ui.broadcast(
        EventType::VersionDeleted,
        json!({ "versionId": id, "jobId": version.job_id }),
    );
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/by-job/{job_id}",
    context_path = "/api/versions",
    tag = "versions",
    responses((status = 200, description = "All versions of the job removed"))
)]
async fn delete_by_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let paths = Version::delete_by_job(&state.db, &job_id).await?;
    let deleted = paths.len();
    for path in paths {
        storage::spawn_remove_dir(path);
    }

    state.ui.broadcast(
        EventType::VersionDeleted,
        json!({ "jobId": job_id, "deletedCount": deleted }),
    );
    Ok(Json(json!({ "deleted": deleted })))
}

#[utoipa::path(
    delete,
    path = "/by-server/{server_id}",
    context_path = "/api/versions",
    tag = "versions",
    responses((status = 200, description = "All versions across the server's jobs removed"))
)]
async fn delete_by_server(
    State(state): State<SharedState>,
    Path(server_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let paths = Version::delete_by_server(&state.db, &server_id).await?;
    let deleted = paths.len();
    for path in paths {
        storage::spawn_remove_dir(path);
    }
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(list_versions, get_version, delete_version, delete_by_job, delete_by_server),
    components(schemas(Version))
)]
pub struct VersionsApiDoc;
