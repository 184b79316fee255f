use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub compaction: CompactionHealth,
}

#[derive(Debug, Serialize)]
pub struct CompactionHealth {
    pub healthy: bool,
    pub last_success_nanos: Option<i64>,
    pub consecutive_errors: u32,
}

/// `GET /v1/health`: `{status,uptime,compaction:{healthy,…}}`; 503 when
/// degraded.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.compaction_monitor.status().await;
    let body = HealthResponse {
        status: if status.healthy { "ok" } else { "degraded" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        compaction: CompactionHealth {
            healthy: status.healthy,
            last_success_nanos: status.last_success_nanos,
            consecutive_errors: status.consecutive_errors,
        },
    };
    let code = if status.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}
