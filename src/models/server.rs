//! Server model: a remote host under management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::Result;

/// Agent connection state as persisted on the server row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Disconnected,
    Connected,
    Updating,
    Error,
}

/// A managed remote host. The SSH credentials are used once at deploy time
/// and never stored; afterwards the agent dials back over WebSocket.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: i64,
    pub ssh_user: String,
    pub agent_status: AgentStatus,
    pub agent_version: Option<String>,
    pub agent_last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateServerRequest {
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// One-shot SSH password used to deploy the agent; never persisted.
    pub password: Option<String>,
}

fn default_port() -> i64 {
    22
}

fn default_ssh_user() -> String {
    "root".into()
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateServerRequest {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<i64>,
    pub ssh_user: Option<String>,
}

impl Server {
    pub async fn find_all(db: &SqlitePool) -> Result<Vec<Server>> {
        let servers =
            sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY created_at DESC")
                .fetch_all(db)
                .await?;
        Ok(servers)
    }

    pub async fn find_by_id(db: &SqlitePool, id: &str) -> Result<Option<Server>> {
        let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(server)
    }

    pub async fn create(db: &SqlitePool, req: &CreateServerRequest) -> Result<Server> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO servers (id, name, hostname, port, ssh_user, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&req.name)
        .bind(&req.hostname)
        .bind(req.port)
        .bind(&req.ssh_user)
        .bind(now)
        .bind(now)
        .execute(db)
        .await?;

        Self::find_by_id(db, &id)
            .await?
            .ok_or_else(|| crate::error::AppError::Database("Created server row vanished".into()))
    }

    pub async fn update(
        db: &SqlitePool,
        id: &str,
        req: &UpdateServerRequest,
    ) -> Result<Option<Server>> {
        let result = sqlx::query(
            "UPDATE servers SET
                 name = COALESCE(?, name),
                 hostname = COALESCE(?, hostname),
                 port = COALESCE(?, port),
                 ssh_user = COALESCE(?, ssh_user),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(&req.name)
        .bind(&req.hostname)
        .bind(req.port)
        .bind(&req.ssh_user)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Self::find_by_id(db, id).await
    }

    /// Record a successful agent registration: connected, with the version
    /// the agent reported and a fresh last-seen instant.
    pub async fn mark_agent_connected(db: &SqlitePool, id: &str, version: &str) -> Result<()> {
        sqlx::query(
            "UPDATE servers SET agent_status = 'connected', agent_version = ?,
                 agent_last_seen = ?, updated_at = ? WHERE id = ?",
        )
        .bind(version)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn set_agent_status(db: &SqlitePool, id: &str, status: AgentStatus) -> Result<()> {
        sqlx::query("UPDATE servers SET agent_status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
