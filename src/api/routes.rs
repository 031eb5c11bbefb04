//! Route definitions for the API.

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers;
use super::SharedState;
use crate::ws;

/// Create the main router: REST API, the two WebSocket endpoints, and the
/// Swagger UI.
pub fn create_router(state: SharedState) -> Router {
    let openapi = super::openapi::build_openapi();

    let api = Router::new()
        .nest("/api/servers", handlers::servers::router())
        .nest("/api/jobs", handlers::jobs::router())
        .nest("/api/versions", handlers::versions::router())
        .nest("/api/storage", handlers::storage::router())
        .nest("/api/files", handlers::files::router())
        .nest("/api/agent", handlers::agent::router())
        .route("/health", get(handlers::health::health_check))
        // UI and agent sockets live on distinct paths.
        .route("/ws", get(ws::ui::ws_handler))
        .route("/ws/agent", get(ws::agent::ws_handler));

    let mut router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", openapi))
        .merge(api);

    // Uploads stream whole files from agents; the 2 MB default body limit
    // would truncate them.
    router = router.layer(DefaultBodyLimit::disable());

    router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
