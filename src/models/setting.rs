//! Key-value settings store. The only required key is `backup_root`.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::error::Result;

pub const BACKUP_ROOT_KEY: &str = "backup_root";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

impl Setting {
    pub async fn get(db: &SqlitePool, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(db)
            .await?;
        Ok(value)
    }

    pub async fn set(db: &SqlitePool, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Convenience accessor for the configured backup root.
    pub async fn backup_root(db: &SqlitePool) -> Result<Option<String>> {
        Self::get(db, BACKUP_ROOT_KEY).await
    }
}
