use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::query::Series;
use crate::storage::{QueryRequest as StorageQueryRequest, TimeRange};
use crate::AppState;

const DEFAULT_MAX_POINTS: usize = 1000;
const MAX_MAX_POINTS: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct RangeQueryParams {
    pub metric: String,
    pub start: i64,
    pub end: i64,
    #[serde(rename = "maxPoints")]
    pub max_points: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RangeQueryResponse {
    pub metric: String,
    pub points: Vec<(i64, f64)>,
}

/// `GET /v1/query`: a raw range scan over one series key with
/// stride-based downsampling to at most `maxPoints`.
pub async fn range_query(
    State(state): State<AppState>,
    Query(params): Query<RangeQueryParams>,
) -> Result<Json<RangeQueryResponse>> {
    let max_points = params.max_points.unwrap_or(DEFAULT_MAX_POINTS).min(MAX_MAX_POINTS);
    let cancel = CancelToken::new();

    let samples = state
        .storage
        .query(
            &StorageQueryRequest {
                series_key: params.metric.clone(),
                range: TimeRange { start_nanos: params.start, end_nanos: params.end },
            },
            &cancel,
        )
        .await?;

    let points: Vec<(i64, f64)> = samples.iter().map(|s| (s.timestamp_nanos, s.value)).collect();
    Ok(Json(RangeQueryResponse {
        metric: params.metric,
        points: downsample(points, max_points),
    }))
}

fn downsample(points: Vec<(i64, f64)>, max_points: usize) -> Vec<(i64, f64)> {
    if points.len() <= max_points || max_points == 0 {
        return points;
    }
    let stride = (points.len() as f64 / max_points as f64).ceil() as usize;
    points.into_iter().step_by(stride.max(1)).collect()
}

#[derive(Debug, Deserialize)]
pub struct ExecuteQueryRequest {
    pub query: String,
    pub start: i64,
    pub end: i64,
    pub step: f64,
}

#[derive(Debug, Serialize)]
pub struct ExecuteQueryResponse {
    pub status: &'static str,
    pub data: QueryData,
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct QueryData {
    #[serde(rename = "resultType")]
    pub result_type: &'static str,
    pub result: Vec<SeriesResult>,
}

#[derive(Debug, Serialize)]
pub struct SeriesResult {
    pub metric: std::collections::BTreeMap<String, String>,
    pub values: Vec<(i64, f64)>,
}

/// `POST /v1/query/execute`: parse + execute over `[start,end]`.
pub async fn execute_query(
    State(state): State<AppState>,
    Json(body): Json<ExecuteQueryRequest>,
) -> Result<Json<ExecuteQueryResponse>> {
    let cancel = CancelToken::new();
    let expr = state.executor.parse(&body.query)?;
    let matrix = state.executor.eval(&expr, body.start, body.end, body.step, &cancel).await?;

    Ok(Json(ExecuteQueryResponse {
        status: "success",
        data: QueryData {
            result_type: "matrix",
            result: matrix.into_iter().map(series_to_result).collect(),
        },
        query: body.query,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InstantQueryParams {
    pub query: String,
    pub time: i64,
}

#[derive(Debug, Serialize)]
pub struct InstantQueryResponse {
    pub status: &'static str,
    pub data: InstantQueryData,
}

#[derive(Debug, Serialize)]
pub struct InstantQueryData {
    #[serde(rename = "resultType")]
    pub result_type: &'static str,
    pub result: Vec<InstantSeriesResult>,
}

#[derive(Debug, Serialize)]
pub struct InstantSeriesResult {
    pub metric: std::collections::BTreeMap<String, String>,
    pub value: Option<(i64, f64)>,
}

/// `GET /v1/query/instant`: same pipeline over a small window ending at
/// `time`, emitting the last point per series.
pub async fn instant_query(
    State(state): State<AppState>,
    Query(params): Query<InstantQueryParams>,
) -> Result<Json<InstantQueryResponse>> {
    let cancel = CancelToken::new();
    let expr = state.executor.parse(&params.query)?;
    // A small lookback window so instant queries still see the most
    // recent raw sample without requiring `time` to fall exactly on one.
    let window_nanos = 5 * 60 * 1_000_000_000;
    let matrix = state
        .executor
        .eval(&expr, params.time - window_nanos, params.time, 15.0, &cancel)
        .await?;

    let result = matrix
        .into_iter()
        .map(|series| InstantSeriesResult {
            metric: series.labels,
            value: series.points.last().copied(),
        })
        .collect();

    Ok(Json(InstantQueryResponse {
        status: "success",
        data: InstantQueryData { result_type: "vector", result },
    }))
}

fn series_to_result(series: Series) -> SeriesResult {
    SeriesResult { metric: series.labels, values: series.points }
}
