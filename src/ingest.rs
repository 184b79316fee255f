//! Ingest admission contract: batch-size bound, per-sample
//! validation, cardinality admission, optional storage-full check, a
//! timed write, then cardinality recording.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::cardinality::CardinalityTracker;
use crate::config::IngestConfig;
use crate::error::{Result, TinyObsError};
use crate::model::Sample;
use crate::storage::StorageEngine;
use crate::storage_monitor::StorageMonitor;

#[derive(Debug, Serialize)]
pub struct IngestResult {
    pub status: &'static str,
    pub count: usize,
}

pub struct Ingestor {
    storage: Arc<dyn StorageEngine>,
    cardinality: Arc<CardinalityTracker>,
    storage_monitor: Option<Arc<StorageMonitor>>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        cardinality: Arc<CardinalityTracker>,
        storage_monitor: Option<Arc<StorageMonitor>>,
        config: IngestConfig,
    ) -> Self {
        Self {
            storage,
            cardinality,
            storage_monitor,
            config,
        }
    }

    pub async fn ingest(&self, mut batch: Vec<Sample>, now_nanos: i64, cancel: &CancelToken) -> Result<IngestResult> {
        if batch.len() > self.config.max_metrics_per_request {
            return Err(TinyObsError::TooManyMetrics(format!(
                "batch of {} exceeds max_metrics_per_request ({})",
                batch.len(),
                self.config.max_metrics_per_request
            )));
        }

        for sample in &mut batch {
            if sample.timestamp_nanos == 0 {
                sample.timestamp_nanos = now_nanos;
            }
            sample.validate()?;
        }

        // Cardinality stays keyed on the user-visible series identity;
        // the storage write uses the full-label key so a raw sample and
        // same-timestamp aggregate of the same series never collide.
        let mut keyed: Vec<(String, Sample)> = Vec::with_capacity(batch.len());
        for sample in batch {
            self.cardinality.check(&sample.name, &sample.series_key())?;
            let storage_key = sample.storage_key();
            keyed.push((storage_key, sample));
        }

        if let Some(monitor) = &self.storage_monitor {
            if monitor.is_full() {
                return Err(TinyObsError::StorageFull(format!(
                    "used_bytes at or above max_bytes ({})",
                    monitor.max_bytes()
                )));
            }
        }

        let write_timeout = Duration::from_millis(self.config.write_timeout_ms);
        tokio::time::timeout(write_timeout, self.storage.write_batch(&keyed, cancel))
            .await
            .map_err(|_| TinyObsError::ResourceExhausted("write timed out".into()))??;

        for (_, sample) in &keyed {
            self.cardinality.record(&sample.name, &sample.series_key());
        }

        Ok(IngestResult {
            status: "success",
            count: keyed.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardinalityConfig;
    use crate::model::SampleType;
    use crate::storage::memory::MemoryEngine;
    use std::collections::BTreeMap;

    fn sample(name: &str, ts: i64) -> Sample {
        Sample {
            name: name.into(),
            sample_type: SampleType::Gauge,
            value: 1.0,
            labels: BTreeMap::new(),
            timestamp_nanos: ts,
        }
    }

    fn ingestor() -> Ingestor {
        Ingestor::new(
            Arc::new(MemoryEngine::new()),
            Arc::new(CardinalityTracker::new(CardinalityConfig {
                max_unique_series: 100,
                max_series_per_metric: 100,
            })),
            None,
            IngestConfig {
                max_metrics_per_request: 10,
                write_timeout_ms: 5_000,
            },
        )
    }

    #[tokio::test]
    async fn ingests_valid_batch() {
        let ingestor = ingestor();
        let cancel = CancelToken::new();
        let result = ingestor
            .ingest(vec![sample("cpu", 100)], 999, &cancel)
            .await
            .unwrap();
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn zero_timestamp_defaults_to_now() {
        let ingestor = ingestor();
        let cancel = CancelToken::new();
        let storage = Arc::new(MemoryEngine::new());
        let ingestor = Ingestor::new(
            storage.clone(),
            Arc::new(CardinalityTracker::new(CardinalityConfig {
                max_unique_series: 100,
                max_series_per_metric: 100,
            })),
            None,
            IngestConfig { max_metrics_per_request: 10, write_timeout_ms: 5_000 },
        );
        ingestor.ingest(vec![sample("cpu", 0)], 555, &cancel).await.unwrap();
        let got = storage
            .query(
                &crate::storage::QueryRequest {
                    series_key: "cpu".into(),
                    range: crate::storage::TimeRange { start_nanos: 0, end_nanos: 1000 },
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(got[0].timestamp_nanos, 555);
    }

    #[tokio::test]
    async fn rejects_oversized_batch() {
        let ingestor = ingestor();
        let cancel = CancelToken::new();
        let batch: Vec<Sample> = (0..20).map(|i| sample("cpu", i + 1)).collect();
        let err = ingestor.ingest(batch, 1, &cancel).await;
        assert!(matches!(err, Err(TinyObsError::TooManyMetrics(_))));
    }

    #[tokio::test]
    async fn rejects_cardinality_exceeded_without_mutating_tracker() {
        let cardinality = Arc::new(CardinalityTracker::new(CardinalityConfig {
            max_unique_series: 1,
            max_series_per_metric: 100,
        }));
        let ingestor = Ingestor::new(
            Arc::new(MemoryEngine::new()),
            cardinality.clone(),
            None,
            IngestConfig { max_metrics_per_request: 10, write_timeout_ms: 5_000 },
        );
        let cancel = CancelToken::new();
        ingestor.ingest(vec![sample("cpu", 1)], 1, &cancel).await.unwrap();
        let err = ingestor.ingest(vec![sample("mem", 2)], 1, &cancel).await;
        assert!(matches!(err, Err(TinyObsError::CardinalityExceeded(_))));
        assert_eq!(cardinality.stats().total_series, 1);
    }
}
