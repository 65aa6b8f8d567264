//! REST API module using Axum
//!
//! Compact operational surface for the monitor: liveness, status, recent
//! alerts and aggregates, the latest measurement per city, and the alert
//! acknowledgment action. Every response uses the uniform envelope.

pub mod envelope;
pub mod handlers;
mod routes;

pub use handlers::ApiState;

use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `AIRWARDEN_CORS_ORIGINS` to a comma-separated list of allowed origins
/// for dashboard development (e.g., `http://localhost:5173`).
fn build_cors_layer() -> CorsLayer {
    match std::env::var("AIRWARDEN_CORS_ORIGINS") {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE])
        }
        Err(_) => {
            // No cross-origin allowed by default
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE])
        }
    }
}

/// Create the complete application router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .merge(routes::api_routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}
