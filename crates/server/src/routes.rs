//! Route configuration.

use crate::auth::identity_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

/// Room for multipart framing and text fields around a chunk payload.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let chunk_limit =
        usize::try_from(state.config.server.max_chunk_size).unwrap_or(usize::MAX / 2)
            + MULTIPART_OVERHEAD;

    let upload_routes = Router::new()
        .route(
            "/api/v1/files/start-upload",
            post(handlers::start_upload),
        )
        .route(
            "/api/v1/files/upload-chunk",
            post(handlers::upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route(
            "/api/v1/files/uploads/{upload_id}",
            get(handlers::get_upload_status).delete(handlers::cancel_upload),
        )
        .route(
            "/api/v1/files/uploads/{upload_id}/complete",
            post(handlers::retry_completion),
        );

    let file_routes = Router::new()
        // Per-file size is enforced while streaming.
        .route(
            "/api/v1/files/upload",
            post(handlers::upload_files).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/v1/files/list", get(handlers::list_files))
        .route(
            "/api/v1/files/download/{file_id}",
            get(handlers::download_file),
        )
        .route(
            "/api/v1/files/{file_id}/versions",
            get(handlers::list_versions),
        )
        .route(
            "/api/v1/files/{file_id}",
            delete(handlers::delete_file),
        );

    // Health check is unauthenticated for load balancers.
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(upload_routes)
        .merge(file_routes);

    // When enabled, /metrics must be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            identity_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
