//! Job management endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::job::{CreateJobRequest, UpdateJobRequest};
use crate::models::{Job, JobLog, Server, Setting};
use crate::services::orchestrator::StartOutcome;
use crate::services::SchedulerService;
use crate::storage;
use crate::ws::agent::REQUEST_TIMEOUT;
use crate::ws::EventType;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job).put(update_job).delete(delete_job))
        .route("/{id}/run", post(run_job))
        .route("/{id}/cancel", post(cancel_job))
        .route("/{id}/logs", get(job_logs))
}

#[utoipa::path(
    get,
    path = "/",
    context_path = "/api/jobs",
    tag = "jobs",
    responses((status = 200, description = "All jobs", body = [Job]))
)]
async fn list_jobs(State(state): State<SharedState>) -> Result<Json<Vec<Job>>> {
    Ok(Json(Job::find_all(&state.db).await?))
}

#[utoipa::path(
    get,
    path = "/{id}",
    context_path = "/api/jobs",
    tag = "jobs",
    responses(
        (status = 200, description = "Job detail", body = Job),
        (status = 404, description = "Unknown job"),
    )
)]
async fn get_job(State(state): State<SharedState>, Path(id): Path<String>) -> Result<Json<Job>> {
    Job::find_by_id(&state.db, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Job not found".into()))
}

/// Ask the agent whether every remote path exists before accepting a job.
async fn validate_remote_paths(
    state: &SharedState,
    server_id: &str,
    paths: &[String],
) -> Result<()> {
    if !state.agents.is_connected(server_id) {
        return Err(AppError::AgentUnavailable("Agent is not connected".into()));
    }
    for path in paths {
        let response = state
            .agents
            .request(server_id, "fs:browse", json!({ "path": path }), REQUEST_TIMEOUT)
            .await?;
        if let Some(error) = response.get("error").and_then(|e| e.as_str()) {
            return Err(AppError::Unprocessable(format!(
                "Remote path {} is not accessible: {}",
                path, error
            )));
        }
    }
    Ok(())
}

/// Create a job. Requires a configured backup root; the local base path is
/// allocated from server and job name slugs, collision-free across all jobs.
#[utoipa::path(
    post,
    path = "/",
    context_path = "/api/jobs",
    tag = "jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 201, description = "Job created", body = Job),
        (status = 400, description = "Backup root not configured or bad input"),
        (status = 422, description = "No remote paths, or a path is missing on the remote"),
        (status = 503, description = "Agent not connected"),
    )
)]
async fn create_job(
    State(state): State<SharedState>,
    Json(body): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>)> {
    if body.name.is_empty() {
        return Err(AppError::Validation("name is required".into()));
    }
    if body.remote_paths.is_empty() {
        return Err(AppError::Unprocessable("remote_paths must not be empty".into()));
    }
    let backup_root = Setting::backup_root(&state.db)
        .await?
        .ok_or_else(|| AppError::Precondition("Backup root is not configured".into()))?;
    let server = Server::find_by_id(&state.db, &body.server_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Server not found".into()))?;

    if let Some(expression) = body.cron_schedule.as_deref().filter(|c| !c.is_empty()) {
        SchedulerService::parse_expression(expression)?;
    }

    validate_remote_paths(&state, &server.id, &body.remote_paths).await?;

    let existing = Job::all_local_paths(&state.db).await?;
    let local_path =
        storage::allocate_local_path(&backup_root, &server.name, &body.name, &existing)?;

    let job = Job::create(&state.db, &body, &local_path).await?;

    if job.enabled {
        if let Some(expression) = job.cron_schedule.as_deref().filter(|c| !c.is_empty()) {
            if let Err(e) = state.scheduler.schedule(&job.id, expression) {
                tracing::error!(job_id = %job.id, error = %e, "Failed to schedule new job");
            }
        }
    }

    state
        .ui
        .broadcast(EventType::JobCreated, json!({ "jobId": job.id }));
    Ok((StatusCode::CREATED, Json(job)))
}

/// Update a job. Changed remote paths are re-validated against the agent; a
/// name change re-allocates the local base path and moves the existing tree.
#[utoipa::path(
    put,
    path = "/{id}",
    context_path = "/api/jobs",
    tag = "jobs",
    request_body = UpdateJobRequest,
    responses(
        (status = 200, description = "Updated job", body = Job),
        (status = 404, description = "Unknown job"),
    )
)]
async fn update_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateJobRequest>,
) -> Result<Json<Job>> {
    let job = Job::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound("Job not found".into()))?;

    if let Some(paths) = &body.remote_paths {
        if paths.is_empty() {
            return Err(AppError::Unprocessable("remote_paths must not be empty".into()));
        }
        validate_remote_paths(&state, &job.server_id, paths).await?;
    }
    if let Some(Some(expression)) = &body.cron_schedule {
        if !expression.is_empty() {
            SchedulerService::parse_expression(expression)?;
        }
    }

    // A rename moves the job to a fresh slug-derived base path.
    let mut new_local_path = None;
    if let Some(name) = body.name.as_deref().filter(|n| *n != job.name) {
        let backup_root = Setting::backup_root(&state.db)
            .await?
            .ok_or_else(|| AppError::Precondition("Backup root is not configured".into()))?;
        let server = Server::find_by_id(&state.db, &job.server_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Server not found".into()))?;
        let existing = Job::all_local_paths(&state.db).await?;
        let allocated = storage::allocate_local_path(&backup_root, &server.name, name, &existing)?;

        if tokio::fs::metadata(&job.local_path).await.is_ok() {
            if let Some(parent) = std::path::Path::new(&allocated).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&job.local_path, &allocated).await?;
        }
        new_local_path = Some(allocated);
    }

    let updated = Job::update(&state.db, &id, &body, new_local_path.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound("Job not found".into()))?;

    // Reconcile the schedule with the new cron / enabled state.
    match updated.cron_schedule.as_deref().filter(|c| !c.is_empty()) {
        Some(expression) if updated.enabled => {
            if let Err(e) = state.scheduler.schedule(&updated.id, expression) {
                tracing::error!(job_id = %updated.id, error = %e, "Failed to reschedule job");
            }
        }
        _ => state.scheduler.unschedule(&updated.id),
    }

    state
        .ui
        .broadcast(EventType::JobUpdated, json!({ "jobId": updated.id }));
    Ok(Json(updated))
}

#[utoipa::path(
    delete,
    path = "/{id}",
    context_path = "/api/jobs",
    tag = "jobs",
    responses(
        (status = 204, description = "Job deleted"),
        (status = 404, description = "Unknown job"),
    )
)]
async fn delete_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if state.orchestrator.is_running(&id) {
        let _ = state.orchestrator.cancel(&id).await;
    }
    state.scheduler.unschedule(&id);

    if !Job::delete(&state.db, &id).await? {
        return Err(AppError::NotFound("Job not found".into()));
    }
    state
        .ui
        .broadcast(EventType::JobDeleted, json!({ "jobId": id }));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RunJobRequest {
    /// Skip link-dest deduplication and re-upload everything
    #[serde(default)]
    pub full: bool,
}

#[utoipa::path(
    post,
    path = "/{id}/run",
    context_path = "/api/jobs",
    tag = "jobs",
    request_body = RunJobRequest,
    responses(
        (status = 202, description = "Run accepted"),
        (status = 404, description = "Unknown job"),
        (status = 409, description = "Job already running"),
        (status = 503, description = "Agent not connected"),
    )
)]
async fn run_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<RunJobRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let full = body.map(|Json(b)| b.full).unwrap_or(false);
    match state.orchestrator.start(&id, full).await? {
        StartOutcome::Started => Ok((StatusCode::ACCEPTED, Json(json!({ "started": true })))),
        StartOutcome::AlreadyRunning => {
            Err(AppError::Conflict("Job is already running".into()))
        }
    }
}

#[utoipa::path(
    post,
    path = "/{id}/cancel",
    context_path = "/api/jobs",
    tag = "jobs",
    responses(
        (status = 200, description = "Cancellation requested"),
        (status = 404, description = "Job is not running"),
    )
)]
async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.orchestrator.cancel(&id).await?;
    Ok(Json(json!({ "cancelled": true })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogsQuery {
    pub limit: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/{id}/logs",
    context_path = "/api/jobs",
    tag = "jobs",
    params(("limit" = Option<i64>, Query, description = "Max log rows, default 50")),
    responses((status = 200, description = "Run logs, newest first", body = [JobLog]))
)]
async fn job_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<JobLog>>> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(JobLog::find_by_job(&state.db, &id, limit).await?))
}

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(list_jobs, get_job, create_job, update_job, delete_job, run_job, cancel_job, job_logs),
    components(schemas(Job, JobLog, CreateJobRequest, UpdateJobRequest, RunJobRequest))
)]
pub struct JobsApiDoc;
