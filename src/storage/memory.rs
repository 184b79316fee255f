//! Bounded in-memory [`StorageEngine`] used by tests and local development.
//! Keys follow the same 16-byte layout as the LSM engine so the two
//! implementations agree on ordering.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::{GcOutcome, Result, TinyObsError};
use crate::model::{Resolution, Sample};

use super::keys::{bucket_end, bucket_start, encode_key, hash_series};
use super::{QueryRequest, StorageEngine, StorageStats, TimeRange};

#[derive(Default)]
pub struct MemoryEngine {
    // Ordered by the same 16-byte key the LSM engine uses; value is the
    // serialized sample. A `BTreeMap` gives the range scans the compactor
    // and query executor need without a dependency on the real engine.
    data: Mutex<BTreeMap<[u8; 16], Vec<u8>>>,
    max_entries: Option<usize>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            max_entries: None,
        }
    }

    /// Construct an engine that rejects writes once it holds `max_entries`
    /// samples, used by tests exercising `StorageFull`.
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            max_entries: Some(max_entries),
        }
    }

    fn encode_sample(sample: &Sample) -> Result<Vec<u8>> {
        serde_json::to_vec(sample)
            .map_err(|e| TinyObsError::StorageUnavailable(format!("encode failed: {e}")))
    }

    fn decode_sample(bytes: &[u8]) -> Result<Sample> {
        serde_json::from_slice(bytes)
            .map_err(|e| TinyObsError::StorageUnavailable(format!("decode failed: {e}")))
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn write(&self, series_key: &str, sample: &Sample, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let hash = hash_series(series_key);
        let key = encode_key(hash, sample.timestamp_nanos);
        let value = Self::encode_sample(sample)?;

        let mut data = self.data.lock().unwrap();
        if let Some(max) = self.max_entries {
            if data.len() >= max && !data.contains_key(&key) {
                return Err(TinyObsError::StorageFull(
                    "in-memory engine at capacity".into(),
                ));
            }
        }
        data.insert(key, value);
        Ok(())
    }

    async fn write_batch(&self, samples: &[(String, Sample)], cancel: &CancelToken) -> Result<()> {
        for (i, (series_key, sample)) in samples.iter().enumerate() {
            if i % 100 == 0 {
                cancel.check()?;
            }
            self.write(series_key, sample, cancel).await?;
        }
        Ok(())
    }

    async fn query(&self, req: &QueryRequest, cancel: &CancelToken) -> Result<Vec<Sample>> {
        cancel.check()?;
        let hash = hash_series(&req.series_key);
        let lo = encode_key(hash, req.range.start_nanos);
        let hi = encode_key(hash, req.range.end_nanos);

        let data = self.data.lock().unwrap();
        let mut out = Vec::new();
        for (i, (_, bytes)) in data.range(lo..hi).enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            out.push(Self::decode_sample(bytes)?);
        }
        Ok(out)
    }

    async fn scan_all(&self, range: TimeRange, cancel: &CancelToken) -> Result<Vec<Sample>> {
        cancel.check()?;
        let data = self.data.lock().unwrap();
        let mut out = Vec::new();
        for (i, (key, bytes)) in data.iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            let Some((_, ts)) = super::keys::decode_key(key) else {
                continue;
            };
            if ts < range.start_nanos || ts >= range.end_nanos {
                continue;
            }
            out.push(Self::decode_sample(bytes)?);
        }
        Ok(out)
    }

    async fn delete_range(&self, series_key: &str, range: TimeRange, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let hash = hash_series(series_key);
        let lo = encode_key(hash, range.start_nanos);
        let hi = encode_key(hash, range.end_nanos);

        let mut data = self.data.lock().unwrap();
        let doomed: Vec<[u8; 16]> = data.range(lo..hi).map(|(k, _)| *k).collect();
        for (i, key) in doomed.iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            data.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, before_nanos: i64, resolution: Option<Resolution>, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let mut data = self.data.lock().unwrap();
        let mut doomed = Vec::new();
        for (i, (key, bytes)) in data.iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            let Some((_, ts)) = super::keys::decode_key(key) else {
                continue;
            };
            if ts >= before_nanos {
                continue;
            }
            if let Some(want) = resolution {
                let Ok(sample) = Self::decode_sample(bytes) else {
                    continue;
                };
                if sample.resolution() != want {
                    continue;
                }
            }
            doomed.push(*key);
        }
        for key in &doomed {
            data.remove(key);
        }
        Ok(())
    }

    async fn stats(&self, cancel: &CancelToken) -> Result<StorageStats> {
        cancel.check()?;
        let data = self.data.lock().unwrap();
        let mut size_bytes = 0u64;
        let mut total_samples = 0u64;
        let mut series_hashes: HashSet<u64> = HashSet::new();
        let mut oldest_ts: Option<i64> = None;
        let mut newest_ts: Option<i64> = None;
        for (i, (key, bytes)) in data.iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            size_bytes += key.len() as u64 + bytes.len() as u64;
            total_samples += 1;
            if let Some((hash, ts)) = super::keys::decode_key(key) {
                series_hashes.insert(hash);
                oldest_ts = Some(oldest_ts.map_or(ts, |o| o.min(ts)));
                newest_ts = Some(newest_ts.map_or(ts, |n| n.max(ts)));
            }
        }
        Ok(StorageStats {
            total_samples,
            total_series: series_hashes.len() as u64,
            size_bytes,
            oldest_ts,
            newest_ts,
        })
    }

    async fn run_gc(&self, _cancel: &CancelToken) -> Result<GcOutcome> {
        // Nothing to compact in a flat map; always a no-op.
        Ok(GcOutcome::NoReclaim)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
fn full_bucket_range(series_hash: u64) -> ([u8; 16], [u8; 16]) {
    (bucket_start(series_hash), bucket_end(series_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleType;
    use std::collections::BTreeMap as Map;

    fn sample(ts: i64, value: f64) -> Sample {
        Sample {
            name: "cpu".into(),
            sample_type: SampleType::Gauge,
            value,
            labels: Map::new(),
            timestamp_nanos: ts,
        }
    }

    #[tokio::test]
    async fn write_then_query_round_trips() {
        let engine = MemoryEngine::new();
        let cancel = CancelToken::new();
        engine.write("cpu,host=a", &sample(100, 1.0), &cancel).await.unwrap();
        engine.write("cpu,host=a", &sample(200, 2.0), &cancel).await.unwrap();

        let req = QueryRequest {
            series_key: "cpu,host=a".into(),
            range: TimeRange { start_nanos: 0, end_nanos: 300 },
        };
        let got = engine.query(&req, &cancel).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].timestamp_nanos, 100);
        assert_eq!(got[1].timestamp_nanos, 200);
    }

    #[tokio::test]
    async fn distinct_series_do_not_collide() {
        let engine = MemoryEngine::new();
        let cancel = CancelToken::new();
        engine.write("cpu,host=a", &sample(100, 1.0), &cancel).await.unwrap();
        engine.write("cpu,host=b", &sample(100, 9.0), &cancel).await.unwrap();

        let req = QueryRequest {
            series_key: "cpu,host=a".into(),
            range: TimeRange { start_nanos: 0, end_nanos: 1000 },
        };
        let got = engine.query(&req, &cancel).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, 1.0);
    }

    #[tokio::test]
    async fn bounded_engine_rejects_past_capacity() {
        let engine = MemoryEngine::bounded(1);
        let cancel = CancelToken::new();
        engine.write("cpu,host=a", &sample(100, 1.0), &cancel).await.unwrap();
        let err = engine.write("cpu,host=b", &sample(100, 1.0), &cancel).await;
        assert!(matches!(err, Err(TinyObsError::StorageFull(_))));
    }

    #[tokio::test]
    async fn cancelled_token_stops_writes() {
        let engine = MemoryEngine::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine.write("cpu,host=a", &sample(100, 1.0), &cancel).await;
        assert!(matches!(err, Err(TinyObsError::Cancelled)));
    }

    #[tokio::test]
    async fn scan_all_finds_samples_across_series() {
        let engine = MemoryEngine::new();
        let cancel = CancelToken::new();
        engine.write("cpu,host=a", &sample(100, 1.0), &cancel).await.unwrap();
        engine.write("mem,host=b", &sample(150, 2.0), &cancel).await.unwrap();
        engine.write("cpu,host=a", &sample(9_000, 3.0), &cancel).await.unwrap();

        let got = engine
            .scan_all(TimeRange { start_nanos: 0, end_nanos: 1000 }, &cancel)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn stats_reports_counts_and_bounds() {
        let engine = MemoryEngine::new();
        let cancel = CancelToken::new();
        engine.write("cpu,host=a", &sample(100, 1.0), &cancel).await.unwrap();
        engine.write("cpu,host=a", &sample(500, 2.0), &cancel).await.unwrap();
        engine.write("mem,host=b", &sample(200, 3.0), &cancel).await.unwrap();

        let stats = engine.stats(&cancel).await.unwrap();
        assert_eq!(stats.total_samples, 3);
        assert_eq!(stats.total_series, 2);
        assert_eq!(stats.oldest_ts, Some(100));
        assert_eq!(stats.newest_ts, Some(500));
        assert!(stats.size_bytes > 0);
    }

    #[tokio::test]
    async fn delete_removes_only_matching_resolution_before_cutoff() {
        let engine = MemoryEngine::new();
        let cancel = CancelToken::new();
        let raw = sample(100, 1.0);
        let mut aggregate = sample(100, 2.0);
        aggregate.labels.insert(crate::model::LABEL_RESOLUTION.to_string(), "5m".to_string());
        let late_raw = sample(9_000, 3.0);

        engine.write("cpu,host=a", &raw, &cancel).await.unwrap();
        engine.write("cpu,host=a|agg", &aggregate, &cancel).await.unwrap();
        engine.write("cpu,host=a", &late_raw, &cancel).await.unwrap();

        engine.delete(1_000, Some(crate::model::Resolution::FiveMin), &cancel).await.unwrap();

        let remaining = engine
            .scan_all(TimeRange { start_nanos: 0, end_nanos: 10_000 }, &cancel)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|s| !s.is_aggregate()));
    }

    #[tokio::test]
    async fn delete_range_removes_only_in_range() {
        let engine = MemoryEngine::new();
        let cancel = CancelToken::new();
        engine.write("cpu,host=a", &sample(100, 1.0), &cancel).await.unwrap();
        engine.write("cpu,host=a", &sample(500, 2.0), &cancel).await.unwrap();

        engine
            .delete_range("cpu,host=a", TimeRange { start_nanos: 0, end_nanos: 300 }, &cancel)
            .await
            .unwrap();

        let req = QueryRequest {
            series_key: "cpu,host=a".into(),
            range: TimeRange { start_nanos: 0, end_nanos: 1000 },
        };
        let got = engine.query(&req, &cancel).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp_nanos, 500);
    }
}
