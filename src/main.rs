//! Backup controller - main entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backup_controller::{
    api::{self, AppState},
    config::Config,
    db,
    error::Result,
    models::Setting,
    services::db_snapshot_service,
    shutdown,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(port = config.port, "Starting backup controller");

    std::fs::create_dir_all(&config.data_dir)?;

    let db_pool = db::create_pool(&config.db_path()).await?;
    db::migrate(&db_pool).await?;
    tracing::info!("Database ready");

    // Daily file-level snapshot of the database, seven kept.
    if let Err(e) = db_snapshot_service::snapshot_database(&config.db_path(), &config.data_dir) {
        tracing::warn!(error = %e, "Failed to create database snapshot");
    }

    // First boot: default the backup root from the environment.
    if Setting::backup_root(&db_pool).await?.is_none() {
        std::fs::create_dir_all(&config.backups_dir)?;
        let default_root = config.backups_dir.to_string_lossy();
        Setting::set(&db_pool, "backup_root", &default_root).await?;
        tracing::info!(backup_root = %default_root, "Initialized backup root from BACKUPS_DIR");
    }

    let state = Arc::new(AppState::new(config.clone(), db_pool));

    // Background services.
    state
        .ping
        .spawn(state.db.clone(), state.agents.clone(), state.ui.clone());
    if let Err(e) = state.scheduler.init_from_db().await {
        tracing::warn!(error = %e, "Failed to initialize schedules");
    }
    state.scheduler.spawn();

    let app = api::routes::create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::wait_for_signal())
        .await?;

    tracing::info!("Shutting down...");
    shutdown::teardown(&state).await;
    tracing::info!("Server stopped");

    Ok(())
}
