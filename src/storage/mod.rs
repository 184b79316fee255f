//! Storage engine abstraction. Two implementations share
//! this trait: an in-memory bounded map used by tests and the
//! `aeternusdb`-backed LSM engine used in production.

pub mod keys;
pub mod lsm;
pub mod memory;

use crate::cancel::CancelToken;
use crate::error::{GcOutcome, Result};
use crate::model::{Resolution, Sample};

/// A half-open timestamp range, in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub start_nanos: i64,
    pub end_nanos: i64,
}

/// A scan over one series's samples, narrowed to an optional time range
/// and resolution. Used by both the query executor and the compactor.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub series_key: String,
    pub range: TimeRange,
}

/// Engine-wide stats, computed by a full cancellable scan since there is
/// no name/label index to derive them from incrementally. `total_series`
/// counts distinct 64-bit series hashes observed during the scan, so it
/// is subject to the same hash-collision risk as the storage key itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    pub total_samples: u64,
    pub total_series: u64,
    pub size_bytes: u64,
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
}

/// Capability set every storage engine must provide. `run_gc` is part of
/// this same trait rather than a separate one, since the in-memory engine
/// has nothing to reclaim but still must report `NoReclaim` rather than
/// erroring.
#[async_trait::async_trait]
pub trait StorageEngine: Send + Sync {
    /// Persist one sample. Series key and timestamp derive the storage key
    ///; callers are responsible for calling this at most once
    /// per bounded interval under `cancel`.
    async fn write(&self, series_key: &str, sample: &Sample, cancel: &CancelToken) -> Result<()>;

    /// Write a batch, checking `cancel` at least once per 100 samples
    ///.
    async fn write_batch(&self, samples: &[(String, Sample)], cancel: &CancelToken) -> Result<()>;

    /// Scan one series's samples within a time range, checking `cancel` at
    /// least once per 1000 scanned entries.
    async fn query(&self, req: &QueryRequest, cancel: &CancelToken) -> Result<Vec<Sample>>;

    /// Full scan across every series, filtered to `range` by the caller.
    /// There is no name/label index, so the query
    /// executor and compactor both post-filter this by name/labels/
    /// resolution themselves; checks `cancel` at least once per 1000
    /// scanned entries.
    async fn scan_all(&self, range: TimeRange, cancel: &CancelToken) -> Result<Vec<Sample>>;

    /// Remove all samples for a series within a time range, used by the
    /// compactor after it has written the aggregated replacement.
    async fn delete_range(&self, series_key: &str, range: TimeRange, cancel: &CancelToken) -> Result<()>;

    /// Remove every sample, across all series, with `timestamp_nanos`
    /// strictly before `before_nanos` whose resolution matches
    /// `resolution` (`None` matches raw and aggregate samples alike).
    /// Checks `cancel` at least once per 1000 scanned entries.
    async fn delete(&self, before_nanos: i64, resolution: Option<Resolution>, cancel: &CancelToken) -> Result<()>;

    /// Compute engine-wide stats via a full, cancellable scan.
    async fn stats(&self, cancel: &CancelToken) -> Result<StorageStats>;

    /// Best-effort reclamation pass (e.g. major compaction). Engines with
    /// no reclaimable space return `Ok(GcOutcome::NoReclaim)`, never an
    /// error.
    async fn run_gc(&self, cancel: &CancelToken) -> Result<GcOutcome>;

    async fn close(&self) -> Result<()>;
}
