//! Multi-resolution compactor. Runs two aggregation
//! passes — raw to 5 minute, then 5 minute to 1 hour — plus the combined
//! cycle the lifecycle supervisor schedules.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::{make_aggregate_sample, Resolution, Sample};
use crate::storage::{StorageEngine, TimeRange};

const SECS_5M: i64 = 5 * 60;
const SECS_1H: i64 = 60 * 60;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Per-bucket accumulator. `labels` are defensively copied on first touch
/// so the caller's source map stays free to mutate.
#[derive(Clone)]
struct Bucket {
    name: String,
    labels: BTreeMap<String, String>,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

impl Bucket {
    fn seed(name: &str, labels: &BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            labels: labels.clone(),
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn accumulate(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, sum: f64, count: u64, min: f64, max: f64) {
        self.sum += sum;
        self.count += count;
        self.min = self.min.min(min);
        self.max = self.max.max(max);
    }
}

fn floor_to(ts_nanos: i64, bucket_secs: i64) -> i64 {
    let bucket_nanos = bucket_secs * NANOS_PER_SEC;
    ts_nanos.div_euclid(bucket_nanos) * bucket_nanos
}

pub struct Compactor {
    storage: Arc<dyn StorageEngine>,
}

impl Compactor {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage }
    }

    /// Aggregate raw samples in `[start,end)` into 5-minute buckets. Any
    /// aggregate already present at a bucket is overwritten: the emitted
    /// sample replaces a prior 5m aggregate at the same key since it is
    /// recomputed from the full raw window, not merged with it.
    pub async fn compact_5m(&self, start_nanos: i64, end_nanos: i64, cancel: &CancelToken) -> Result<usize> {
        let raw = self
            .storage
            .scan_all(TimeRange { start_nanos, end_nanos }, cancel)
            .await?;

        let mut buckets: BTreeMap<(String, i64), Bucket> = BTreeMap::new();
        for sample in raw.iter().filter(|s| !s.is_aggregate()) {
            let labels = sample.user_labels();
            let bucket_start = floor_to(sample.timestamp_nanos, SECS_5M);
            let key = (sample.series_key(), bucket_start);
            buckets
                .entry(key)
                .or_insert_with(|| Bucket::seed(&sample.name, &labels))
                .accumulate(sample.value);
        }

        self.emit_buckets(buckets, Resolution::FiveMin, cancel).await
    }

    /// Combine 5m aggregates in `[start,end)` into 1-hour buckets. Samples
    /// that are not 5m aggregates — raw samples, or 1h aggregates —
    /// are skipped.
    pub async fn compact_1h(&self, start_nanos: i64, end_nanos: i64, cancel: &CancelToken) -> Result<usize> {
        let samples = self
            .storage
            .scan_all(TimeRange { start_nanos, end_nanos }, cancel)
            .await?;

        let mut buckets: BTreeMap<(String, i64), Bucket> = BTreeMap::new();
        for sample in samples.iter().filter(|s| s.resolution() == Resolution::FiveMin) {
            let Some((sum, count, min, max)) = extract_aggregate(sample) else {
                continue;
            };
            let labels = sample.user_labels();
            let bucket_start = floor_to(sample.timestamp_nanos, SECS_1H);
            let key = (sample.series_key(), bucket_start);
            buckets
                .entry(key)
                .or_insert_with(|| Bucket::seed(&sample.name, &labels))
                .merge(sum, count, min, max);
        }

        self.emit_buckets(buckets, Resolution::OneHour, cancel).await
    }

    /// One `CompactAndCleanup` cycle: 5m over the 6h-delayed
    /// late-arrival window, then 1h over the 2d-delayed window. Retention
    /// deletion is deferred (open question, see DESIGN.md).
    pub async fn compact_and_cleanup(&self, now_nanos: i64, cancel: &CancelToken) -> Result<(usize, usize)> {
        let hour = 3600 * NANOS_PER_SEC;
        let day = 24 * hour;

        let five_min_emitted = self
            .compact_5m(now_nanos - 12 * hour, now_nanos - 6 * hour, cancel)
            .await?;
        let one_hour_emitted = self
            .compact_1h(now_nanos - 7 * day, now_nanos - 2 * day, cancel)
            .await?;

        Ok((five_min_emitted, one_hour_emitted))
    }

    async fn emit_buckets(
        &self,
        buckets: BTreeMap<(String, i64), Bucket>,
        resolution: Resolution,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let mut emitted = 0usize;
        let keyed: Vec<((String, i64), Bucket)> = buckets.into_iter().collect();
        for (i, ((_series_key, bucket_start), bucket)) in keyed.into_iter().enumerate() {
            if i % 100 == 0 {
                cancel.check()?;
            }
            if bucket.count == 0 {
                continue;
            }
            let aggregate = make_aggregate_sample(
                &bucket.name,
                &bucket.labels,
                bucket_start,
                resolution,
                bucket.sum,
                bucket.count,
                bucket.min,
                bucket.max,
            );
            // Hash the aggregate's own storage key (full label set, reserved
            // metadata included), not the raw grouping key: an aggregate's
            // bucket-start timestamp can equal a raw sample's own timestamp,
            // and sharing the raw series_key would collide the two in the
            // 16-byte keyspace.
            let storage_key = aggregate.storage_key();
            self.storage.write(&storage_key, &aggregate, cancel).await?;
            emitted += 1;
        }
        Ok(emitted)
    }
}

fn extract_aggregate(sample: &Sample) -> Option<(f64, u64, f64, f64)> {
    use crate::model::{LABEL_COUNT, LABEL_MAX, LABEL_MIN, LABEL_SUM};
    let sum: f64 = sample.labels.get(LABEL_SUM)?.parse().ok()?;
    let count: u64 = sample.labels.get(LABEL_COUNT)?.parse().ok()?;
    let min: f64 = sample.labels.get(LABEL_MIN)?.parse().ok()?;
    let max: f64 = sample.labels.get(LABEL_MAX)?.parse().ok()?;
    Some((sum, count, min, max))
}

/// Linear-interpolated percentile over `values`. Empty input
/// returns 0; `values` need not be pre-sorted.
pub fn calculate_percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = p * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleType;
    use std::collections::BTreeMap as Map;

    fn raw(name: &str, value: f64, ts: i64) -> Sample {
        Sample {
            name: name.into(),
            sample_type: SampleType::Gauge,
            value,
            labels: Map::new(),
            timestamp_nanos: ts,
        }
    }

    #[tokio::test]
    async fn compact_5m_emits_one_bucket_per_series() {
        let storage = Arc::new(crate::storage::memory::MemoryEngine::new());
        let cancel = CancelToken::new();
        storage.write("cpu", &raw("cpu", 10.0, 0), &cancel).await.unwrap();
        storage.write("cpu", &raw("cpu", 20.0, 60 * NANOS_PER_SEC), &cancel).await.unwrap();

        let compactor = Compactor::new(storage.clone());
        let emitted = compactor.compact_5m(0, 10 * 60 * NANOS_PER_SEC, &cancel).await.unwrap();
        assert_eq!(emitted, 1);

        // Aggregates hash to a storage key distinct from the raw series'
        // own key, so finding one means scanning the whole keyspace rather
        // than querying by the raw series_key.
        let got = storage
            .scan_all(TimeRange { start_nanos: 0, end_nanos: 10 * 60 * NANOS_PER_SEC }, &cancel)
            .await
            .unwrap();
        let agg = got.iter().find(|s| s.is_aggregate()).unwrap();
        assert_eq!(agg.labels.get(crate::model::LABEL_SUM).unwrap(), "30");
        assert_eq!(agg.labels.get(crate::model::LABEL_COUNT).unwrap(), "2");
    }

    #[tokio::test]
    async fn compact_5m_is_idempotent() {
        let storage = Arc::new(crate::storage::memory::MemoryEngine::new());
        let cancel = CancelToken::new();
        storage.write("cpu", &raw("cpu", 10.0, 0), &cancel).await.unwrap();

        let compactor = Compactor::new(storage.clone());
        compactor.compact_5m(0, 10 * 60 * NANOS_PER_SEC, &cancel).await.unwrap();
        compactor.compact_5m(0, 10 * 60 * NANOS_PER_SEC, &cancel).await.unwrap();

        let got = storage
            .scan_all(TimeRange { start_nanos: 0, end_nanos: 10 * 60 * NANOS_PER_SEC }, &cancel)
            .await
            .unwrap();
        let aggregates: Vec<_> = got.iter().filter(|s| s.is_aggregate()).collect();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].labels.get(crate::model::LABEL_SUM).unwrap(), "10");
    }

    #[tokio::test]
    async fn raw_sample_on_bucket_boundary_is_not_clobbered_by_its_aggregate() {
        let storage = Arc::new(crate::storage::memory::MemoryEngine::new());
        let cancel = CancelToken::new();
        // Minutes 0..4 all fall in the same 5m bucket, and the bucket start
        // for minute 0 equals minute 0's own timestamp exactly.
        for minute in 0..4i64 {
            let ts = minute * 60 * NANOS_PER_SEC;
            storage.write("cpu", &raw("cpu", minute as f64, ts), &cancel).await.unwrap();
        }

        let compactor = Compactor::new(storage.clone());
        let emitted = compactor.compact_5m(0, 10 * 60 * NANOS_PER_SEC, &cancel).await.unwrap();
        assert_eq!(emitted, 1);

        let got = storage
            .scan_all(TimeRange { start_nanos: 0, end_nanos: 10 * 60 * NANOS_PER_SEC }, &cancel)
            .await
            .unwrap();
        assert_eq!(got.len(), 5, "expected 4 raw samples plus 1 aggregate");
        assert_eq!(got.iter().filter(|s| !s.is_aggregate()).count(), 4);
        assert_eq!(got.iter().filter(|s| s.is_aggregate()).count(), 1);
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(calculate_percentile(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
        assert_eq!(calculate_percentile(&[], 0.9), 0.0);
        assert_eq!(calculate_percentile(&[42.0], 0.9), 42.0);
    }

    #[test]
    fn floor_to_aligns_to_bucket() {
        assert_eq!(floor_to(NANOS_PER_SEC * 301, SECS_5M), NANOS_PER_SEC * 300);
        assert_eq!(floor_to(0, SECS_5M), 0);
    }
}
