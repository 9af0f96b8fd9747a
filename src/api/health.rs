//! Health check endpoints
//!
//! Liveness, readiness (backed by the pool summary) and a general status
//! endpoint for monitoring.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::server::state::AppState;
use crate::services::PoolHealthSummary;

/// Response for the general health check
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
    /// Registered credentials, disabled ones included
    pub credentials: usize,
    /// Whether the rotation monitor loop is alive
    pub monitor_running: bool,
}

/// Response for the readiness check
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub pool: PoolHealthSummary,
}

/// Response for the liveness check
#[derive(Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
}

/// Main health check endpoint
///
/// Reports version, uptime, pool size and whether the rotation monitor is
/// running. Always 200 while the process can answer; use `/ready` to gate
/// traffic.
///
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.settings.app_version.clone(),
        environment: state.settings.environment.to_string(),
        uptime_seconds: state.uptime_seconds(),
        credentials: state.pool.len(),
        monitor_running: state.monitor.is_running(),
    })
}

/// Readiness check endpoint
///
/// Ready while at least one credential can take traffic (HEALTHY, or
/// HALF_OPEN with a free trial slot). Answers 503 with the per-status counts
/// otherwise, so a load balancer stops routing to a gateway whose whole pool
/// is cooling down.
///
/// GET /ready
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let pool = state.pool.summary();
    let ready = pool.is_serving;

    let status = if ready {
        StatusCode::OK
    } else {
        tracing::warn!(
            total = pool.total,
            open = pool.open_count,
            disabled = pool.disabled_count,
            "Service not ready: no eligible credential"
        );
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, pool }))
}

/// Liveness check endpoint
///
/// Only checks that the process is scheduling requests.
///
/// GET /liveness
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { alive: true })
}
