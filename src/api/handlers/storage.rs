//! Storage settings, confined browsing, disk usage, and the hierarchy view.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::setting::BACKUP_ROOT_KEY;
use crate::models::{Job, Server, Setting, Version};
use crate::storage::browse::{self, DirEntry, DiskUsage};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/settings", get(get_settings).put(update_settings))
        .route("/browse", get(browse_root))
        .route("/browse-version", get(browse_version))
        .route("/disk-usage", get(disk_usage))
        .route("/hierarchy", get(hierarchy))
}

#[utoipa::path(
    get,
    path = "/settings",
    context_path = "/api/storage",
    tag = "storage",
    responses((status = 200, description = "Current backup root, null when unset"))
)]
async fn get_settings(State(state): State<SharedState>) -> Result<Json<Value>> {
    let backup_root = Setting::backup_root(&state.db).await?;
    Ok(Json(json!({ "backup_root": backup_root })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateSettingsRequest {
    pub backup_root: String,
}

/// Change the backup root. Existing content is moved over first (rolled back
/// on failure), then all job and version paths are rewritten together with
/// the setting inside one transaction, so the operator never observes a
/// half-migrated state.
#[utoipa::path(
    put,
    path = "/settings",
    context_path = "/api/storage",
    tag = "storage",
    request_body = UpdateSettingsRequest,
    responses(
        (status = 200, description = "Backup root updated"),
        (status = 400, description = "Target missing or not a directory"),
    )
)]
async fn update_settings(
    State(state): State<SharedState>,
    Json(body): Json<UpdateSettingsRequest>,
) -> Result<Json<Value>> {
    if body.backup_root.is_empty() {
        return Err(AppError::Validation("backup_root is required".into()));
    }
    let new_root = body.backup_root.clone();
    if !Path::new(&new_root).is_dir() {
        return Err(AppError::Validation(
            "Path does not exist or is not a directory".into(),
        ));
    }

    let old_root = Setting::backup_root(&state.db).await?;
    let moved = match &old_root {
        Some(old) if *old != new_root => move_root_contents(old, &new_root)?,
        _ => Vec::new(),
    };

    let result: Result<()> = async {
        let mut tx = state.db.begin().await?;
        if let Some(old) = &old_root {
            if *old != new_root {
                Job::rebase_local_paths(&mut tx, old, &new_root).await?;
                Version::rebase_local_paths(&mut tx, old, &new_root).await?;
            }
        }
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(BACKUP_ROOT_KEY)
        .bind(&new_root)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        // Put the files back where the still-valid rows point.
        if let Some(old) = &old_root {
            rollback_moves(&new_root, old, &moved);
        }
        return Err(e);
    }

    tracing::info!(backup_root = %new_root, "Backup root updated");
    Ok(Json(json!({ "backup_root": new_root })))
}

/// Move every child of `old` into `new`, returning the moved names so a
/// failed transaction can undo them. The first rename failure rolls back
/// the earlier ones and aborts.
fn move_root_contents(old: &str, new: &str) -> Result<Vec<std::ffi::OsString>> {
    let mut moved = Vec::new();
    let entries = std::fs::read_dir(old)
        .map_err(|e| AppError::Storage(format!("Failed to read old backup root: {}", e)))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let dest = PathBuf::from(new).join(&name);
        if let Err(e) = std::fs::rename(entry.path(), &dest) {
            rollback_moves(new, old, &moved);
            return Err(AppError::Storage(format!(
                "Failed to move {} to new backup root: {}",
                name.to_string_lossy(),
                e
            )));
        }
        moved.push(name);
    }
    Ok(moved)
}

/// Undo `move_root_contents`: rename the moved entries from `new` back into
/// `old`. Best effort: a rename back can only fail if the filesystem
/// changed underneath us, which is logged and left for the operator.
fn rollback_moves(new: &str, old: &str, moved: &[std::ffi::OsString]) {
    for name in moved {
        let from = PathBuf::from(new).join(name);
        let back = PathBuf::from(old).join(name);
        if let Err(e) = std::fs::rename(&from, &back) {
            tracing::error!(
                entry = %name.to_string_lossy(),
                error = %e,
                "Failed to roll back backup root move"
            );
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BrowseQuery {
    pub path: Option<String>,
}

#[utoipa::path(
    get,
    path = "/browse",
    context_path = "/api/storage",
    tag = "storage",
    params(("path" = Option<String>, Query, description = "Path relative to the backup root")),
    responses(
        (status = 200, description = "Directory entries", body = [DirEntry]),
        (status = 400, description = "Backup root not configured"),
        (status = 403, description = "Path escapes the backup root"),
    )
)]
async fn browse_root(
    State(state): State<SharedState>,
    Query(query): Query<BrowseQuery>,
) -> Result<Json<Vec<DirEntry>>> {
    let sub_path = query.path.unwrap_or_else(|| "/".into());
    let backup_root = Setting::backup_root(&state.db)
        .await?
        .ok_or_else(|| AppError::Precondition("Backup root is not configured".into()))?;

    let entries =
        tokio::task::spawn_blocking(move || browse::list_directory(&backup_root, &sub_path))
            .await
            .map_err(|e| AppError::Internal(format!("Browse task panicked: {}", e)))??;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BrowseVersionQuery {
    pub version_id: String,
    pub path: Option<String>,
}

#[utoipa::path(
    get,
    path = "/browse-version",
    context_path = "/api/storage",
    tag = "storage",
    params(
        ("version_id" = String, Query, description = "Version to browse"),
        ("path" = Option<String>, Query, description = "Path relative to the version root"),
    ),
    responses(
        (status = 200, description = "Directory entries", body = [DirEntry]),
        (status = 403, description = "Path escapes the version root"),
        (status = 404, description = "Unknown version"),
    )
)]
async fn browse_version(
    State(state): State<SharedState>,
    Query(query): Query<BrowseVersionQuery>,
) -> Result<Json<Vec<DirEntry>>> {
    let sub_path = query.path.unwrap_or_else(|| "/".into());
    let version = Version::find_by_id(&state.db, &query.version_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Version not found".into()))?;

    let entries = tokio::task::spawn_blocking(move || {
        browse::list_directory(&version.local_path, &sub_path)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Browse task panicked: {}", e)))??;
    Ok(Json(entries))
}

#[utoipa::path(
    get,
    path = "/disk-usage",
    context_path = "/api/storage",
    tag = "storage",
    responses(
        (status = 200, description = "Filesystem usage at the backup root", body = DiskUsage),
        (status = 400, description = "Backup root not configured"),
    )
)]
async fn disk_usage(State(state): State<SharedState>) -> Result<Json<DiskUsage>> {
    let backup_root = Setting::backup_root(&state.db)
        .await?
        .ok_or_else(|| AppError::Precondition("Backup root is not configured".into()))?;

    let usage = tokio::task::spawn_blocking(move || browse::disk_usage(&backup_root))
        .await
        .map_err(|e| AppError::Internal(format!("Disk usage task panicked: {}", e)))??;
    Ok(Json(usage))
}

/// Aggregated servers → jobs → versions tree with sizes.
#[utoipa::path(
    get,
    path = "/hierarchy",
    context_path = "/api/storage",
    tag = "storage",
    responses((status = 200, description = "Storage hierarchy with per-job sizes"))
)]
async fn hierarchy(State(state): State<SharedState>) -> Result<Json<Value>> {
    let servers = Server::find_all(&state.db).await?;
    let mut tree = Vec::new();

    for server in servers {
        let jobs = Job::find_by_server(&state.db, &server.id).await?;
        let mut job_nodes = Vec::new();
        let mut total_versions = 0usize;

        for job in jobs {
            let versions = Version::find_by_job(&state.db, &job.id).await?;
            let total_size: i64 = versions.iter().map(|v| v.bytes_transferred).sum();
            total_versions += versions.len();

            job_nodes.push(json!({
                "id": job.id,
                "name": job.name,
                "remote_paths": job.remote_path_list(),
                "local_path": job.local_path,
                "versions": versions,
                "totalSize": total_size,
            }));
        }

        tree.push(json!({
            "id": server.id,
            "name": server.name,
            "hostname": server.hostname,
            "port": server.port,
            "jobs": job_nodes,
            "totalVersions": total_versions,
        }));
    }

    Ok(Json(json!({ "servers": tree })))
}

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(get_settings, update_settings, browse_root, browse_version, disk_usage, hierarchy),
    components(schemas(UpdateSettingsRequest, DirEntry, DiskUsage))
)]
pub struct StorageApiDoc;
