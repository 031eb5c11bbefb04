//! File transfer endpoints used by agents.
//!
//! Uploads land inside the job's running version directory so every snapshot
//! is self-contained. The body is the raw file content, optionally
//! zstd-compressed; size is verified after the last byte and a mismatch
//! discards the partial file.

use axum::extract::{Path as AxumPath, Request, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use utoipa::ToSchema;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::Version;
use crate::storage;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/upload", post(upload_file))
        .route("/manifest/{job_id}", get(get_manifest))
        .route("/hardlink", post(create_hardlinks))
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))
}

/// Streaming upload from an agent.
///
/// Headers: `x-job-id`, `x-relative-path` (relative to the version root),
/// `x-total-size` (bytes expected after decompression), and optionally
/// `content-encoding: zstd`.
#[utoipa::path(
    post,
    path = "/upload",
    context_path = "/api/files",
    tag = "files",
    responses(
        (status = 200, description = "File stored"),
        (status = 400, description = "Missing headers or size mismatch"),
        (status = 403, description = "Relative path escapes the version root"),
        (status = 409, description = "No running version for the job"),
    )
)]
async fn upload_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<Value>> {
    let job_id = required_header(&headers, "x-job-id")?;
    let relative_path = required_header(&headers, "x-relative-path")?;
    let total_size: u64 = required_header(&headers, "x-total-size")?
        .parse()
        .map_err(|_| AppError::Validation("Invalid x-total-size header".into()))?;
    let zstd_encoded = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("zstd"))
        .unwrap_or(false);

    // Uploads only ever target the active snapshot.
    let version = Version::find_running(&state.db, &job_id)
        .await?
        .ok_or_else(|| AppError::Conflict("Job has no running version".into()))?;

    let version_root = PathBuf::from(&version.local_path);
    let dest_path = storage::confine_relative(&version_root, &relative_path)?;
    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::debug!(
        job_id = %job_id,
        relative_path = %relative_path,
        total_size,
        zstd = zstd_encoded,
        "Receiving file upload"
    );

    let mut stream = request.into_body().into_data_stream();
    let write_result = if zstd_encoded {
        // Compressed chunks are piped into a blocking zstd decoder that
        // writes straight to disk; nothing is buffered whole.
        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let decode_dest = dest_path.clone();
        let decoder = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::create(&decode_dest)?;
            let mut decoder = zstd::stream::write::Decoder::new(file)?;
            while let Ok(chunk) = rx.recv() {
                decoder.write_all(&chunk)?;
            }
            decoder.flush()?;
            Ok(())
        });

        let mut feed_error = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(bytes.to_vec()).is_err() {
                        break; // decoder bailed; its error is authoritative
                    }
                }
                Err(e) => {
                    feed_error = Some(AppError::Validation(format!("Upload read error: {}", e)));
                    break;
                }
            }
        }
        drop(tx);

        let decode_result = decoder
            .await
            .map_err(|e| AppError::Internal(format!("Decoder task panicked: {}", e)))?;
        match (feed_error, decode_result) {
            (Some(e), _) => Err(e),
            (None, Err(e)) => Err(AppError::Validation(format!(
                "Zstd decompression failed: {}",
                e
            ))),
            (None, Ok(())) => Ok(()),
        }
    } else {
        let mut file = tokio::fs::File::create(&dest_path).await?;
        let mut result = Ok(());
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => file.write_all(&bytes).await?,
                Err(e) => {
                    result = Err(AppError::Validation(format!("Upload read error: {}", e)));
                    break;
                }
            }
        }
        file.flush().await?;
        result
    };

    if let Err(e) = write_result {
        let _ = tokio::fs::remove_file(&dest_path).await;
        return Err(e);
    }

    let written = tokio::fs::metadata(&dest_path).await?.len();
    if written != total_size {
        tracing::warn!(
            job_id = %job_id,
            relative_path = %relative_path,
            expected = total_size,
            actual = written,
            "File size mismatch after upload"
        );
        let _ = tokio::fs::remove_file(&dest_path).await;
        return Err(AppError::Validation(format!(
            "File size mismatch: expected {} got {}",
            total_size, written
        )));
    }

    Ok(Json(json!({
        "success": true,
        "path": relative_path,
        "size": written,
    })))
}

/// Manifest of the latest completed version. The agent diffs against it to
/// decide which files changed since the previous snapshot.
#[utoipa::path(
    get,
    path = "/manifest/{job_id}",
    context_path = "/api/files",
    tag = "files",
    responses(
        (status = 200, description = "Manifest JSON"),
        (status = 404, description = "No completed version or no manifest"),
    )
)]
async fn get_manifest(
    State(state): State<SharedState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Json<Value>> {
    let previous = Version::find_latest_completed(&state.db, &job_id)
        .await?
        .ok_or_else(|| AppError::NotFound("No completed version found".into()))?;

    let manifest_path = PathBuf::from(&previous.local_path).join(".backup-manifest.json");
    let content = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|_| AppError::NotFound("Manifest not found for latest version".into()))?;

    let manifest: Value = serde_json::from_str(&content)
        .map_err(|e| AppError::Internal(format!("Invalid manifest JSON: {}", e)))?;
    Ok(Json(manifest))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct HardlinkRequest {
    pub job_id: String,
    /// Paths relative to the version roots
    pub files: Vec<String>,
}

/// Materialize unchanged files into the running version as hard links
/// against the previous completed snapshot (the link-dest mechanism). Each
/// snapshot stays a complete, browsable tree without re-uploading bytes.
#[utoipa::path(
    post,
    path = "/hardlink",
    context_path = "/api/files",
    tag = "files",
    request_body = HardlinkRequest,
    responses(
        (status = 200, description = "Per-file link results"),
        (status = 409, description = "No running or no completed version"),
    )
)]
async fn create_hardlinks(
    State(state): State<SharedState>,
    Json(body): Json<HardlinkRequest>,
) -> Result<Json<Value>> {
    let running = Version::find_running(&state.db, &body.job_id)
        .await?
        .ok_or_else(|| AppError::Conflict("Job has no running version".into()))?;
    let previous = Version::find_latest_completed(&state.db, &body.job_id)
        .await?
        .ok_or_else(|| AppError::Conflict("Job has no completed version to link against".into()))?;

    let current_root = PathBuf::from(running.local_path);
    let previous_root = PathBuf::from(previous.local_path);
    let files = body.files;

    let (linked, failed) = tokio::task::spawn_blocking(move || {
        let mut linked = 0u64;
        let mut failed = 0u64;

        for relative in &files {
            let (src, dst) = match (
                storage::confine_relative(&previous_root, relative),
                storage::confine_relative(&current_root, relative),
            ) {
                (Ok(src), Ok(dst)) => (src, dst),
                _ => {
                    tracing::warn!(path = %relative, "Hardlink path rejected");
                    failed += 1;
                    continue;
                }
            };

            if !src.exists() {
                tracing::warn!(path = %relative, "Hardlink source does not exist");
                failed += 1;
                continue;
            }
            if let Some(parent) = dst.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::hard_link(&src, &dst) {
                Ok(()) => linked += 1,
                Err(e) => {
                    tracing::warn!(path = %relative, error = %e, "Hardlink failed");
                    failed += 1;
                }
            }
        }
        (linked, failed)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Hardlink task panicked: {}", e)))?;

    tracing::info!(job_id = %body.job_id, linked, failed, "Hardlink pass completed");
    Ok(Json(json!({ "linked": linked, "failed": failed })))
}

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(upload_file, get_manifest, create_hardlinks),
    components(schemas(HardlinkRequest))
)]
pub struct FilesApiDoc;
