//! Snapshot version model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Running,
    Completed,
    Failed,
}

/// One snapshot attempt. A running or failed version is never pointed to by
/// the job's "current" link.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct Version {
    pub id: String,
    pub job_id: String,
    pub log_id: Option<String>,
    /// Lexicographically sortable `YYYY-MM-DD_HH-MM-SS`
    pub version_timestamp: String,
    pub local_path: String,
    pub status: VersionStatus,
    pub bytes_total: i64,
    pub files_total: i64,
    pub bytes_transferred: i64,
    pub files_transferred: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Version {
    pub async fn find_all(db: &SqlitePool) -> Result<Vec<Version>> {
        let versions = sqlx::query_as::<_, Version>(
            "SELECT * FROM versions ORDER BY version_timestamp DESC",
        )
        .fetch_all(db)
        .await?;
        Ok(versions)
    }

    pub async fn find_by_id(db: &SqlitePool, id: &str) -> Result<Option<Version>> {
        let version = sqlx::query_as::<_, Version>("SELECT * FROM versions WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(version)
    }

    pub async fn find_by_job(db: &SqlitePool, job_id: &str) -> Result<Vec<Version>> {
        let versions = sqlx::query_as::<_, Version>(
            "SELECT * FROM versions WHERE job_id = ? ORDER BY version_timestamp DESC",
        )
        .bind(job_id)
        .fetch_all(db)
        .await?;
        Ok(versions)
    }

    /// The newest completed version of a job, if any. Its directory is the
    /// link-dest hint for the next incremental run.
    pub async fn find_latest_completed(
        db: &SqlitePool,
        job_id: &str,
    ) -> Result<Option<Version>> {
        let version = sqlx::query_as::<_, Version>(
            "SELECT * FROM versions WHERE job_id = ? AND status = 'completed'
             ORDER BY version_timestamp DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(db)
        .await?;
        Ok(version)
    }

    /// The version currently receiving uploads for a job, if a run is active.
    pub async fn find_running(db: &SqlitePool, job_id: &str) -> Result<Option<Version>> {
        let version = sqlx::query_as::<_, Version>(
            "SELECT * FROM versions WHERE job_id = ? AND status = 'running'
             ORDER BY version_timestamp DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(db)
        .await?;
        Ok(version)
    }

    pub async fn create(
        db: &SqlitePool,
        job_id: &str,
        log_id: &str,
        version_timestamp: &str,
        local_path: &str,
    ) -> Result<Version> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO versions (id, job_id, log_id, version_timestamp, local_path, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(job_id)
        .bind(log_id)
        .bind(version_timestamp)
        .bind(local_path)
        .bind(Utc::now())
        .execute(db)
        .await?;

        let version = sqlx::query_as::<_, Version>("SELECT * FROM versions WHERE id = ?")
            .bind(&id)
            .fetch_one(db)
            .await?;
        Ok(version)
    }

    /// Seal a version as completed with its final counters.
    pub async fn mark_completed(
        db: &SqlitePool,
        id: &str,
        bytes_transferred: i64,
        files_transferred: i64,
        bytes_total: i64,
        files_total: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE versions SET status = 'completed', bytes_transferred = ?,
                 files_transferred = ?, bytes_total = ?, files_total = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(bytes_transferred)
        .bind(files_transferred)
        .bind(bytes_total)
        .bind(files_total)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(db: &SqlitePool, id: &str) -> Result<()> {
        sqlx::query("UPDATE versions SET status = 'failed', completed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM versions WHERE id = ?")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete all versions of a job; returns the removed local paths so the
    /// caller can schedule filesystem cleanup.
    pub async fn delete_by_job(db: &SqlitePool, job_id: &str) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT local_path FROM versions WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_all(db)
        .await?;

        sqlx::query("DELETE FROM versions WHERE job_id = ?")
            .bind(job_id)
            .execute(db)
            .await?;
        Ok(paths)
    }

    /// Delete all versions across every job of a server.
    pub async fn delete_by_server(db: &SqlitePool, server_id: &str) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT local_path FROM versions
             WHERE job_id IN (SELECT id FROM jobs WHERE server_id = ?)",
        )
        .bind(server_id)
        .fetch_all(db)
        .await?;

        sqlx::query(
            "DELETE FROM versions WHERE job_id IN (SELECT id FROM jobs WHERE server_id = ?)",
        )
        .bind(server_id)
        .execute(db)
        .await?;
        Ok(paths)
    }

    /// Rewrite stored snapshot paths when the backup root moves.
    pub async fn rebase_local_paths(
        db: &mut sqlx::SqliteConnection,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE versions SET local_path = ? || substr(local_path, ?)
             WHERE local_path LIKE ? || '%'",
        )
        .bind(new_prefix)
        .bind(old_prefix.len() as i64 + 1)
        .bind(old_prefix)
        .execute(db)
        .await?;
        Ok(())
    }
}
