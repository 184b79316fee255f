use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::ingest::IngestResult;
use crate::model::Sample;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub metrics: Vec<Sample>,
}

pub async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestRequest>,
) -> Result<Json<IngestResult>> {
    let now_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;
    let cancel = CancelToken::new();
    let result = state.ingestor.ingest(body.metrics, now_nanos, &cancel).await?;
    Ok(Json(result))
}
