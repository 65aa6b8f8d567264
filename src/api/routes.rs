//! API route definitions
//!
//! Organizes the operational endpoints:
//! - /health - liveness and backend summary
//! - /api/status - registry and pipeline counters
//! - /api/alerts - recent alerts, plus per-alert acknowledgment
//! - /api/cities/:city/* - per-city aggregates and latest measurement

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, ApiState};

/// Create all monitor routes.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/status", get(handlers::status))
        .route("/api/alerts", get(handlers::recent_alerts))
        .route("/api/alerts/:id/acknowledge", post(handlers::acknowledge_alert))
        .route("/api/cities/:city/aggregates", get(handlers::city_aggregates))
        .route("/api/cities/:city/latest", get(handlers::city_latest))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CityRegistry, RegistryHandle};
    use crate::pipeline::PipelineStats;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn create_test_state() -> ApiState {
        ApiState::new(
            Arc::new(MemoryStore::new()),
            RegistryHandle::new(CityRegistry::seeded()),
            Arc::new(RwLock::new(PipelineStats::default())),
        )
    }

    #[tokio::test]
    async fn test_api_routes_health() {
        let app = api_routes(create_test_state());

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
    async fn test_api_routes_status() {
        let app = api_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_alerts_empty() {
        let app = api_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/alerts?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_unknown_city_latest_404() {
        let app = api_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/cities/Nowhere/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_routes_acknowledge_missing_alert_404() {
        let app = api_routes(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/alerts/42/acknowledge")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
