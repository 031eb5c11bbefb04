//! Backup job model and per-run audit logs.
//!
//! The ordered remote path list is stored JSON-encoded in a text column;
//! `remote_path_list` / `encode_remote_paths` are the only two places that
//! touch the encoding, so decode∘encode round-trips by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A backup specification bound to a server.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct Job {
    pub id: String,
    pub server_id: String,
    pub name: String,
    /// JSON-encoded ordered list of absolute remote paths
    pub remote_paths: String,
    pub local_path: String,
    pub cron_schedule: Option<String>,
    pub status: JobStatus,
    pub enabled: bool,
    pub retention_count: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the stored remote path list.
    pub fn remote_path_list(&self) -> Vec<String> {
        serde_json::from_str(&self.remote_paths).unwrap_or_default()
    }

    /// Encode a remote path list for storage.
    pub fn encode_remote_paths(paths: &[String]) -> Result<String> {
        Ok(serde_json::to_string(paths)?)
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateJobRequest {
    pub server_id: String,
    pub name: String,
    pub remote_paths: Vec<String>,
    pub cron_schedule: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_retention_count")]
    pub retention_count: i64,
}

fn default_enabled() -> bool {
    true
}

fn default_retention_count() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub remote_paths: Option<Vec<String>>,
    /// `Some(None)` clears the schedule, `None` leaves it untouched
    #[serde(default, with = "double_option")]
    pub cron_schedule: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub retention_count: Option<i64>,
}

/// Distinguish an absent `cron_schedule` key from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Some(Option::<String>::deserialize(de)?))
    }
}

impl Job {
    pub async fn find_all(db: &SqlitePool) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC")
            .fetch_all(db)
            .await?;
        Ok(jobs)
    }

    pub async fn find_by_id(db: &SqlitePool, id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(job)
    }

    pub async fn find_by_server(db: &SqlitePool, server_id: &str) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE server_id = ? ORDER BY created_at DESC",
        )
        .bind(server_id)
        .fetch_all(db)
        .await?;
        Ok(jobs)
    }

    /// All allocated local base paths; used for collision-free allocation.
    pub async fn all_local_paths(db: &SqlitePool) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar::<_, String>("SELECT local_path FROM jobs")
            .fetch_all(db)
            .await?;
        Ok(paths)
    }

    pub async fn create(
        db: &SqlitePool,
        req: &CreateJobRequest,
        local_path: &str,
    ) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let remote_paths = Self::encode_remote_paths(&req.remote_paths)?;
        sqlx::query(
            "INSERT INTO jobs (id, server_id, name, remote_paths, local_path, cron_schedule,
                 enabled, retention_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&req.server_id)
        .bind(&req.name)
        .bind(&remote_paths)
        .bind(local_path)
        .bind(&req.cron_schedule)
        .bind(req.enabled)
        .bind(req.retention_count)
        .bind(now)
        .bind(now)
        .execute(db)
        .await?;

        Self::find_by_id(db, &id)
            .await?
            .ok_or_else(|| crate::error::AppError::Database("Created job row vanished".into()))
    }

    pub async fn update(
        db: &SqlitePool,
        id: &str,
        req: &UpdateJobRequest,
        local_path: Option<&str>,
    ) -> Result<Option<Job>> {
        let remote_paths = match &req.remote_paths {
            Some(paths) => Some(Self::encode_remote_paths(paths)?),
            None => None,
        };

        let result = sqlx::query(
            "UPDATE jobs SET
                 name = COALESCE(?, name),
                 remote_paths = COALESCE(?, remote_paths),
                 local_path = COALESCE(?, local_path),
                 cron_schedule = CASE WHEN ? THEN ? ELSE cron_schedule END,
                 enabled = COALESCE(?, enabled),
                 retention_count = COALESCE(?, retention_count),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(&req.name)
        .bind(&remote_paths)
        .bind(local_path)
        .bind(req.cron_schedule.is_some())
        .bind(req.cron_schedule.clone().flatten())
        .bind(req.enabled)
        .bind(req.retention_count)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Self::find_by_id(db, id).await
    }

    pub async fn update_status(db: &SqlitePool, id: &str, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn set_last_run(db: &SqlitePool, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET last_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(Utc::now())
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Rewrite every local path that starts with `old_prefix` to sit under
    /// `new_prefix` instead. Used when the backup root moves.
    pub async fn rebase_local_paths(
        db: &mut sqlx::SqliteConnection,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET local_path = ? || substr(local_path, ?), updated_at = ?
             WHERE local_path LIKE ? || '%'",
        )
        .bind(new_prefix)
        .bind(old_prefix.len() as i64 + 1)
        .bind(Utc::now())
        .bind(old_prefix)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Per-run audit record. Cascade-deleted with the owning job.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct JobLog {
    pub id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: LogStatus,
    pub bytes_transferred: i64,
    pub files_transferred: i64,
    pub output: String,
    pub error: Option<String>,
}

impl JobLog {
    pub async fn create(db: &SqlitePool, job_id: &str) -> Result<JobLog> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO job_logs (id, job_id, started_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(job_id)
            .bind(Utc::now())
            .execute(db)
            .await?;

        let log = sqlx::query_as::<_, JobLog>("SELECT * FROM job_logs WHERE id = ?")
            .bind(&id)
            .fetch_one(db)
            .await?;
        Ok(log)
    }

    pub async fn finish(
        db: &SqlitePool,
        id: &str,
        status: LogStatus,
        bytes_transferred: i64,
        files_transferred: i64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_logs SET status = ?, bytes_transferred = ?, files_transferred = ?,
                 error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(bytes_transferred)
        .bind(files_transferred)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn find_by_job(db: &SqlitePool, job_id: &str, limit: i64) -> Result<Vec<JobLog>> {
        let logs = sqlx::query_as::<_, JobLog>(
            "SELECT * FROM job_logs WHERE job_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_round_trip() {
        let paths = vec!["/etc".to_string(), "/var/www".to_string()];
        let encoded = Job::encode_remote_paths(&paths).unwrap();
        let decoded: Vec<String> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, paths);
    }

    #[test]
    fn corrupt_remote_paths_decode_to_empty() {
        let job = Job {
            id: "j".into(),
            server_id: "s".into(),
            name: "n".into(),
            remote_paths: "not json".into(),
            local_path: "/tmp/x".into(),
            cron_schedule: None,
            status: JobStatus::Idle,
            enabled: true,
            retention_count: 7,
            last_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(job.remote_path_list().is_empty());
    }

    #[test]
    fn update_request_distinguishes_missing_and_null_cron() {
        let missing: UpdateJobRequest = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert!(missing.cron_schedule.is_none());

        let cleared: UpdateJobRequest =
            serde_json::from_str(r#"{"cron_schedule":null}"#).unwrap();
        assert_eq!(cleared.cron_schedule, Some(None));

        let set: UpdateJobRequest =
            serde_json::from_str(r#"{"cron_schedule":"0 3 * * *"}"#).unwrap();
        assert_eq!(set.cron_schedule, Some(Some("0 3 * * *".into())));
    }
}
