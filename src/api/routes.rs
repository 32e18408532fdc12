//! API Routes
//!
//! Configures the Axum router with all diagnostics endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    cancel_handler, cleanup_handler, emergency_clear_handler, health_handler, load_handler,
    progress_handler, stats_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `POST /load` - Run a foreground load
/// - `POST /cancel` - Cancel outstanding loads
/// - `GET /progress` - Current load progress
/// - `GET /stats` - Cache, persistence and prefetch statistics
/// - `POST /maintenance/cleanup` - Sweep expired entries now
/// - `POST /maintenance/emergency-clear` - Shed a percentage of entries
/// - `GET /health` - Health check endpoint
///
/// # Middleware
/// - CORS: Allows any origin
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/load", post(load_handler))
        .route("/cancel", post(cancel_handler))
        .route("/progress", get(progress_handler))
        .route("/stats", get(stats_handler))
        .route("/maintenance/cleanup", post(cleanup_handler))
        .route("/maintenance/emergency-clear", post(emergency_clear_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use crate::client::DataClient;
    use crate::config::Config;
    use crate::synthetic::SyntheticFetcher;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn create_test_app() -> Router {
        let client = DataClient::new(
            Config::default(),
            Arc::new(SyntheticFetcher::new(10)),
            Box::new(MemoryStorage::new()),
        );
        create_router(AppState::new(client))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_load_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/load")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"entities":["S1"],"range":"7d"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_range_is_rejected() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/load")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"entities":["S1"],"range":"fortnight"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
