//! Shared test fixtures: in-memory database, temp storage root, app state.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use backup_controller::api::{routes, AppState, SharedState};
use backup_controller::config::Config;
use backup_controller::models::{Job, Server, Setting, Version};

pub struct TestContext {
    pub state: SharedState,
    pub pool: SqlitePool,
    /// Owns the on-disk backup root for the test's lifetime
    pub storage_root: tempfile::TempDir,
}

impl TestContext {
    /// Fresh context with migrations applied and a configured backup root.
    pub async fn new() -> Self {
        let ctx = Self::without_backup_root().await;
        let root = ctx.storage_root.path().to_string_lossy();
        Setting::set(&ctx.pool, "backup_root", &root).await.unwrap();
        ctx
    }

    /// Fresh context with no backup root configured.
    pub async fn without_backup_root() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let storage_root = tempfile::tempdir().unwrap();
        let config = test_config();
        let state = Arc::new(AppState::new(config, pool.clone()));

        Self {
            state,
            pool,
            storage_root,
        }
    }

    pub fn router(&self) -> axum::Router {
        routes::create_router(self.state.clone())
    }

    pub async fn insert_server(&self, name: &str, hostname: &str) -> Server {
        let req = serde_json::from_value(serde_json::json!({
            "name": name,
            "hostname": hostname,
        }))
        .unwrap();
        Server::create(&self.pool, &req).await.unwrap()
    }

    pub async fn insert_job(&self, server: &Server, name: &str, remote_paths: &[&str]) -> Job {
        let req = serde_json::from_value(serde_json::json!({
            "server_id": server.id,
            "name": name,
            "remote_paths": remote_paths,
        }))
        .unwrap();
        let root = self.storage_root.path().to_string_lossy();
        let local_path = backup_controller::storage::allocate_local_path(
            &root,
            &server.name,
            name,
            &Job::all_local_paths(&self.pool).await.unwrap(),
        )
        .unwrap();
        std::fs::create_dir_all(&local_path).unwrap();
        Job::create(&self.pool, &req, &local_path).await.unwrap()
    }

    /// Insert a version row with its directory on disk.
    pub async fn insert_version(&self, job: &Job, timestamp: &str, completed: bool) -> Version {
        let log = backup_controller::models::JobLog::create(&self.pool, &job.id)
            .await
            .unwrap();
        let path = backup_controller::storage::version_path(&job.local_path, timestamp);
        std::fs::create_dir_all(&path).unwrap();
        let version = Version::create(
            &self.pool,
            &job.id,
            &log.id,
            timestamp,
            &path.to_string_lossy(),
        )
        .await
        .unwrap();
        if completed {
            Version::mark_completed(&self.pool, &version.id, 1024, 10, 1024, 10)
                .await
                .unwrap();
        }
        Version::find_by_id(&self.pool, &version.id)
            .await
            .unwrap()
            .unwrap()
    }
}

fn test_config() -> Config {
    Config {
        port: 0,
        log_level: "error".into(),
        data_dir: std::env::temp_dir(),
        backups_dir: std::env::temp_dir(),
        max_concurrent_global: 8,
        max_concurrent_per_server: 4,
        backup_server_ip: None,
        agent_binary_path: "bin/backup-agent".into(),
    }
}
