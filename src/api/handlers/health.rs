//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::SharedState;
use crate::models::Setting;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub connected_agents: usize,
    pub ui_clients: usize,
}

#[derive(Serialize, ToSchema)]
pub struct HealthChecks {
    pub database: CheckStatus,
    pub storage: CheckStatus,
}

#[derive(Serialize, ToSchema)]
pub struct CheckStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn healthy() -> CheckStatus {
    CheckStatus {
        status: "healthy".to_string(),
        message: None,
    }
}

fn unhealthy(message: String) -> CheckStatus {
    CheckStatus {
        status: "unhealthy".to_string(),
        message: Some(message),
    }
}

/// Health check: database probe plus a write/read probe against the backup
/// root when one is configured.
#[utoipa::path(
    get,
    path = "/health",
    context_path = "",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let db_check = match sqlx::query("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => healthy(),
        Err(e) => unhealthy(format!("Database query failed: {}", e)),
    };

    let storage_check = match Setting::backup_root(&state.db).await {
        Ok(Some(root)) => check_storage(&root).await,
        Ok(None) => CheckStatus {
            status: "unconfigured".to_string(),
            message: Some("Backup root not set".to_string()),
        },
        Err(e) => unhealthy(format!("Settings lookup failed: {}", e)),
    };

    let overall = if db_check.status == "healthy" {
        "healthy"
    } else {
        "unhealthy"
    };
    let status_code = if overall == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: overall.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            storage: storage_check,
        },
        connected_agents: state.agents.connected_agents().len(),
        ui_clients: state.ui.client_count(),
    };

    (status_code, Json(response))
}

async fn check_storage(root: &str) -> CheckStatus {
    let probe = std::path::Path::new(root).join(".health-probe");
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            healthy()
        }
        Err(e) => unhealthy(format!("Backup root not writable: {}", e)),
    }
}

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(health_check),
    components(schemas(HealthResponse, HealthChecks, CheckStatus))
)]
pub struct HealthApiDoc;
