use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct EngineStatsResponse {
    pub total_samples: u64,
    pub total_series: u64,
    pub size_bytes: u64,
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
}

/// `GET /v1/stats`: storage engine stats, from a full cancellable scan.
pub async fn get_stats(State(state): State<AppState>) -> crate::error::Result<Json<EngineStatsResponse>> {
    let cancel = CancelToken::new();
    let stats = state.storage.stats(&cancel).await?;
    Ok(Json(EngineStatsResponse {
        total_samples: stats.total_samples,
        total_series: stats.total_series,
        size_bytes: stats.size_bytes,
        oldest_ts: stats.oldest_ts,
        newest_ts: stats.newest_ts,
    }))
}

#[derive(Debug, Serialize)]
pub struct CardinalityResponse {
    pub total_series: u64,
    pub by_metric: Vec<MetricSeriesCount>,
    pub utilization_pct: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricSeriesCount {
    pub name: String,
    pub series: u64,
}

/// `GET /v1/cardinality`: series-cardinality stats, shaped to match the
/// engine stats/storage responses' flat style.
pub async fn get_cardinality(State(state): State<AppState>) -> Json<CardinalityResponse> {
    let stats = state.cardinality.stats();
    let by_metric = state
        .cardinality
        .by_metric_counts()
        .into_iter()
        .map(|(name, series)| MetricSeriesCount { name, series })
        .collect();
    Json(CardinalityResponse {
        total_series: stats.total_series,
        by_metric,
        utilization_pct: state.cardinality.utilization_pct(),
    })
}

#[derive(Debug, Serialize)]
pub struct StorageResponse {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

/// `GET /v1/storage`: `{used_bytes,max_bytes}` from the storage monitor.
pub async fn get_storage(State(state): State<AppState>) -> Json<StorageResponse> {
    Json(StorageResponse {
        used_bytes: state.storage_monitor.used_bytes(),
        max_bytes: state.storage_monitor.max_bytes(),
    })
}
