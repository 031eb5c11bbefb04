//! Storage layout management.
//!
//! The backup tree lives under the operator-configured root:
//!
//! ```text
//! <backup_root>/<server-slug>/<job-slug>/
//!     versions/<YYYY-MM-DD_HH-MM-SS>/...   snapshot directories
//!     current -> versions/<latest-good>    relative symlink
//!     .backup-meta.json                    human-readable manifest
//! ```
//!
//! The "current" link is only ever swapped after a version completes, so a
//! failed or running snapshot is never observable through it. Readers must
//! tolerate the link being briefly absent during the swap.

pub mod browse;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::{Job, Server, Version, VersionStatus};

/// Name of the per-job manifest written at the job base path.
pub const JOB_META_FILE: &str = ".backup-meta.json";

/// Name of the per-version manifest written on completion.
pub const VERSION_META_FILE: &str = ".version-meta.json";

/// Filesystem-safe lowercase dashed form of a human name. Runs of
/// non-alphanumeric characters collapse to a single dash; leading and
/// trailing dashes are trimmed.
pub fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Compute a collision-free local base path for a job:
/// `backup_root/<slug(server)>/<slug(job)>`, appending `-2`, `-3`, … until
/// the path is unique among `existing`.
pub fn allocate_local_path(
    backup_root: &str,
    server_name: &str,
    job_name: &str,
    existing: &[String],
) -> Result<String> {
    let server_slug = slug(server_name);
    let job_slug = slug(job_name);
    if server_slug.is_empty() || job_slug.is_empty() {
        return Err(AppError::Validation(
            "name must contain at least one alphanumeric character".into(),
        ));
    }

    let base = Path::new(backup_root).join(&server_slug);
    let candidate = base.join(&job_slug).to_string_lossy().to_string();
    if !existing.contains(&candidate) {
        return Ok(candidate);
    }

    let mut suffix = 2u32;
    loop {
        let candidate = base
            .join(format!("{}-{}", job_slug, suffix))
            .to_string_lossy()
            .to_string();
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

/// Version timestamp derived from the creation instant, lexicographically
/// sortable and unique per job at one-second granularity.
pub fn version_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Absolute path of a version directory inside a job base path.
pub fn version_path(job_local_path: &str, timestamp: &str) -> PathBuf {
    Path::new(job_local_path).join("versions").join(timestamp)
}

/// Create a version directory eagerly so uploads can target it.
pub async fn create_version_dir(job_local_path: &str, timestamp: &str) -> Result<PathBuf> {
    let path = version_path(job_local_path, timestamp);
    tokio::fs::create_dir_all(&path).await?;
    Ok(path)
}

/// Point `current` at the named version. The old link is unlinked first, so
/// readers can observe a brief window with no link — never a stale or
/// half-written one.
pub async fn update_current_link(job_local_path: &str, timestamp: &str) -> Result<()> {
    let link = Path::new(job_local_path).join("current");
    let target = PathBuf::from("versions").join(timestamp);

    match tokio::fs::remove_file(&link).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::symlink(&target, &link).await?;
    Ok(())
}

/// Write the job-level manifest at the base path.
pub async fn write_job_meta(job: &Job, server: &Server) -> Result<()> {
    let meta = json!({
        "server": { "name": server.name, "hostname": server.hostname, "port": server.port },
        "job": { "id": job.id, "name": job.name, "remotePaths": job.remote_path_list() },
        "agent": { "enabled": true },
        "createdAt": job.created_at,
        "lastRunAt": Utc::now(),
    });
    let path = Path::new(&job.local_path).join(JOB_META_FILE);
    tokio::fs::write(&path, serde_json::to_string_pretty(&meta)?).await?;
    Ok(())
}

/// Write the per-version manifest on completion; it mirrors the row fields.
pub async fn write_version_meta(version: &Version) -> Result<()> {
    let meta = json!({
        "version_id": version.id,
        "timestamp": version.version_timestamp,
        "bytes_transferred": version.bytes_transferred,
        "files_transferred": version.files_transferred,
        "status": version.status,
    });
    let path = Path::new(&version.local_path).join(VERSION_META_FILE);
    tokio::fs::write(&path, serde_json::to_string_pretty(&meta)?).await?;
    Ok(())
}

/// Delete a snapshot directory off the request path. Failures are logged and
/// never surfaced; the row is already gone.
pub fn spawn_remove_dir(path: String) {
    tokio::spawn(async move {
        if let Err(e) = tokio::fs::remove_dir_all(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path, error = %e, "Failed to remove version directory");
            }
        }
    });
}

/// Enforce the job's retention count: every completed version beyond the
/// newest `retention_count` is pruned, row first, filesystem async.
pub async fn prune_versions(db: &SqlitePool, job_id: &str, retention_count: i64) -> Result<u64> {
    let versions = Version::find_by_job(db, job_id).await?;
    let completed: Vec<_> = versions
        .into_iter()
        .filter(|v| v.status == VersionStatus::Completed)
        .collect();

    // find_by_job returns newest-first
    let keep = retention_count.max(0) as usize;
    let mut pruned = 0u64;
    for version in completed.iter().skip(keep) {
        Version::delete(db, &version.id).await?;
        spawn_remove_dir(version.local_path.clone());
        pruned += 1;
        tracing::info!(
            version_id = %version.id,
            job_id = %job_id,
            path = %version.local_path,
            "Pruned old backup version"
        );
    }
    Ok(pruned)
}

/// Resolve `sub_path` against `root` and reject anything that escapes it.
/// Both sides are canonicalized, so symlinked parents and `..` segments
/// cannot break out.
pub fn confine(root: &str, sub_path: &str) -> Result<PathBuf> {
    let relative = sub_path.trim_start_matches('/');
    let root_canonical = Path::new(root)
        .canonicalize()
        .map_err(|_| AppError::NotFound("Root path does not exist".into()))?;
    let resolved = root_canonical
        .join(relative)
        .canonicalize()
        .map_err(|_| AppError::NotFound(format!("Path does not exist: {}", sub_path)))?;

    if !resolved.starts_with(&root_canonical) {
        return Err(AppError::Forbidden("Path escapes the allowed root".into()));
    }
    Ok(resolved)
}

/// Lexical containment check for paths that may not exist yet (upload
/// destinations). Rejects absolute paths and any `..` traversal.
pub fn confine_relative(root: &Path, relative: &str) -> Result<PathBuf> {
    use std::path::Component;

    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(AppError::Forbidden("Absolute paths are not allowed".into()));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(AppError::Forbidden("Path escapes the allowed root".into())),
        }
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_and_trims() {
        assert_eq!(slug("Web Server 01"), "web-server-01");
        assert_eq!(slug("  --Hello__World--  "), "hello-world");
        assert_eq!(slug("ALREADY-FINE"), "already-fine");
        assert_eq!(slug("日本語"), "");
    }

    #[test]
    fn allocate_appends_suffix_on_collision() {
        let existing = vec![
            "/srv/backups/web-01/daily".to_string(),
            "/srv/backups/web-01/daily-2".to_string(),
        ];
        let path = allocate_local_path("/srv/backups", "web-01", "Daily", &existing).unwrap();
        assert_eq!(path, "/srv/backups/web-01/daily-3");
    }

    #[test]
    fn allocate_rejects_empty_slug() {
        assert!(allocate_local_path("/srv/backups", "!!!", "Daily", &[]).is_err());
    }

    #[test]
    fn version_timestamp_is_sortable() {
        let a = version_timestamp("2026-01-02T03:04:05Z".parse().unwrap());
        let b = version_timestamp("2026-01-02T03:04:06Z".parse().unwrap());
        assert_eq!(a, "2026-01-02_03-04-05");
        assert!(a < b);
    }

    #[test]
    fn confine_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        assert!(confine(&root, "sub").is_ok());
        let err = confine(&root, "/../../etc/passwd").unwrap_err();
        assert!(matches!(
            err,
            AppError::Forbidden(_) | AppError::NotFound(_)
        ));
    }

    #[test]
    fn confine_relative_rejects_traversal() {
        let root = Path::new("/srv/backups/web-01/daily/versions/v1");
        assert!(confine_relative(root, "etc/hosts").is_ok());
        assert!(confine_relative(root, "../other").is_err());
        assert!(confine_relative(root, "/etc/passwd").is_err());
        assert!(confine_relative(root, "a/../../b").is_err());
    }

    #[tokio::test]
    async fn current_link_swaps_atomically_enough() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().to_string();
        create_version_dir(&base, "2026-01-01_00-00-00").await.unwrap();
        create_version_dir(&base, "2026-01-02_00-00-00").await.unwrap();

        update_current_link(&base, "2026-01-01_00-00-00").await.unwrap();
        update_current_link(&base, "2026-01-02_00-00-00").await.unwrap();

        let target = tokio::fs::read_link(dir.path().join("current")).await.unwrap();
        assert_eq!(target, PathBuf::from("versions/2026-01-02_00-00-00"));
    }
}
