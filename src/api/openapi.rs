//! OpenAPI specification generated from handler annotations via utoipa.

use utoipa::OpenApi;

/// Top-level OpenAPI document for the backup controller API.
///
/// Each handler module contributes its own paths and schemas via per-module
/// `#[derive(OpenApi)]` structs that are merged into this root document at
/// startup.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Backup Controller API",
        description = "Centralized backup controller: agent fleet management, versioned snapshots, live progress.",
        version = "0.1.0",
    ),
    servers(
        (url = "/", description = "Current server"),
    ),
    tags(
        (name = "servers", description = "Managed remote hosts and agent deployment"),
        (name = "jobs", description = "Backup job CRUD, runs, and logs"),
        (name = "versions", description = "Snapshot version management"),
        (name = "storage", description = "Backup root settings, browsing, disk usage"),
        (name = "files", description = "Agent-facing file transfer endpoints"),
        (name = "agent", description = "Agent binary serving and self-update"),
        (name = "health", description = "Health checks"),
    ),
    components(schemas(ErrorResponse))
)]
pub struct ApiDoc;

/// Standard error response body returned by all endpoints on failure.
#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// Machine-readable error code (e.g. "NOT_FOUND", "VALIDATION_ERROR")
    pub code: String,
}

/// Build the merged OpenAPI document from all handler modules.
pub fn build_openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    doc.merge(super::handlers::servers::ServersApiDoc::openapi());
    doc.merge(super::handlers::jobs::JobsApiDoc::openapi());
    doc.merge(super::handlers::versions::VersionsApiDoc::openapi());
    doc.merge(super::handlers::storage::StorageApiDoc::openapi());
    doc.merge(super::handlers::files::FilesApiDoc::openapi());
    doc.merge(super::handlers::agent::AgentApiDoc::openapi());
    doc.merge(super::handlers::health::HealthApiDoc::openapi());

    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_spec_covers_all_modules() {
        let spec = build_openapi();
        assert_eq!(spec.info.title, "Backup Controller API");

        let path_count = spec.paths.paths.len();
        assert!(
            path_count >= 20,
            "Expected at least 20 paths, got {path_count}. A module merge may be missing."
        );
    }
}
