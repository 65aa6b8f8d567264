//! API handlers: consistent envelope, typed responses, ISO-8601 timestamps.
//!
//! All handlers answer through [`reply`] or [`fault`], so every body shares
//! the `{ data | error, meta }` envelope.

use axum::extract::{Path, Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::envelope::{fault, reply, ErrorCode};
use crate::config::RegistryHandle;
use crate::pipeline::PipelineStats;
use crate::store::{StoreAdapter, StoreError};

// ============================================================================
// API State
// ============================================================================

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn StoreAdapter>,
    pub registry: RegistryHandle,
    pub stats: Arc<RwLock<PipelineStats>>,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        registry: RegistryHandle,
        stats: Arc<RwLock<PipelineStats>>,
    ) -> Self {
        Self {
            store,
            registry,
            stats,
            started_at: Utc::now(),
        }
    }

    fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    fn backend(&self) -> &'static str {
        self.store.backend_name()
    }
}

// ============================================================================
// Response types
// ============================================================================

/// Liveness summary for `/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub uptime_secs: u64,
}

/// Operational snapshot for `/api/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub store_backend: &'static str,
    pub monitored_cities: usize,
    pub cities: Vec<String>,
    pub pipeline: PipelineStats,
}

// ============================================================================
// Query types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Response {
    reply(
        state.backend(),
        HealthResponse {
            status: "ok",
            backend: state.backend(),
            uptime_secs: state.uptime_secs(),
        },
    )
}

/// GET /api/status
pub async fn status(State(state): State<ApiState>) -> Response {
    let registry = state.registry.current();
    let pipeline = state.stats.read().await.clone();

    reply(
        state.backend(),
        StatusResponse {
            uptime_secs: state.uptime_secs(),
            store_backend: state.backend(),
            monitored_cities: registry.len(),
            cities: registry.city_names(),
            pipeline,
        },
    )
}

/// GET /api/alerts?limit=50
pub async fn recent_alerts(
    State(state): State<ApiState>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(50).min(1000);
    match state.store.recent_alerts(limit).await {
        Ok(alerts) => reply(state.backend(), alerts),
        Err(e) => store_fault(&state, &e),
    }
}

/// POST /api/alerts/:id/acknowledge
pub async fn acknowledge_alert(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Response {
    match state.store.acknowledge_alert(id).await {
        Ok(()) => reply(state.backend(), serde_json::json!({ "acknowledged": id })),
        Err(StoreError::NotFound) => fault(
            state.backend(),
            ErrorCode::AlertNotFound,
            format!("No alert with id {id}"),
        ),
        Err(e) => store_fault(&state, &e),
    }
}

/// GET /api/cities/:city/aggregates?limit=24
pub async fn city_aggregates(
    State(state): State<ApiState>,
    Path(city): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(24).min(1000);
    match state.store.recent_aggregates(&city, limit).await {
        Ok(aggregates) => reply(state.backend(), aggregates),
        Err(e) => store_fault(&state, &e),
    }
}

/// GET /api/cities/:city/latest
pub async fn city_latest(
    State(state): State<ApiState>,
    Path(city): Path<String>,
) -> Response {
    match state.store.latest_measurement(&city).await {
        Ok(Some(measurement)) => reply(state.backend(), measurement),
        Ok(None) => fault(
            state.backend(),
            ErrorCode::CityNotFound,
            format!("No measurements for {city}"),
        ),
        Err(e) => store_fault(&state, &e),
    }
}

/// Map store failures onto HTTP statuses: transient outages are 503 so
/// pollers back off, everything else is a plain 500.
fn store_fault(state: &ApiState, e: &StoreError) -> Response {
    if e.is_transient() {
        fault(
            state.backend(),
            ErrorCode::StoreUnavailable,
            format!("Store unavailable: {e}"),
        )
    } else {
        fault(
            state.backend(),
            ErrorCode::StoreFailure,
            format!("Store error: {e}"),
        )
    }
}
