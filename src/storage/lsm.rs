//! Production [`StorageEngine`] backed by `aeternusdb`, an embeddable
//! LSM-tree key-value store. `aeternusdb`'s `Db` is a synchronous,
//! thread-safe handle, so every call is pushed onto the blocking pool via
//! `spawn_blocking` rather than run inline on the async executor.

use std::sync::Arc;

use aeternusdb::{Db, DbConfig};
use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::config::StorageConfig;
use crate::error::{GcOutcome, Result, TinyObsError};
use crate::model::{Resolution, Sample};

use super::keys::{encode_key, hash_series};
use super::{QueryRequest, StorageEngine, StorageStats, TimeRange};

pub struct LsmEngine {
    db: Arc<Db>,
    data_dir: String,
}

impl LsmEngine {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            TinyObsError::StorageUnavailable(format!(
                "failed to create data dir {}: {e}",
                config.data_dir
            ))
        })?;

        let db_config = DbConfig {
            write_buffer_size: config.memtable_bytes as usize,
            ..DbConfig::default()
        };

        let db = Db::open(&config.data_dir, db_config)
            .map_err(|e| TinyObsError::StorageUnavailable(format!("open failed: {e}")))?;

        tracing::info!(data_dir = %config.data_dir, "opened LSM storage engine");
        Ok(Self {
            db: Arc::new(db),
            data_dir: config.data_dir.clone(),
        })
    }

    /// Sum of file sizes under the data directory. `aeternusdb` persists
    /// its memtable log and SSTables as regular files, so this tracks
    /// on-disk usage without relying on an engine-internal size API.
    fn dir_size(path: &std::path::Path) -> std::io::Result<u64> {
        let mut total = 0u64;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += Self::dir_size(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
        Ok(total)
    }

    fn encode_sample(sample: &Sample) -> Result<Vec<u8>> {
        serde_json::to_vec(sample)
            .map_err(|e| TinyObsError::StorageUnavailable(format!("encode failed: {e}")))
    }

    fn decode_sample(bytes: &[u8]) -> Result<Sample> {
        serde_json::from_slice(bytes)
            .map_err(|e| TinyObsError::StorageUnavailable(format!("decode failed: {e}")))
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Db) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| TinyObsError::StorageUnavailable(format!("blocking task panicked: {e}")))?
    }
}

#[async_trait]
impl StorageEngine for LsmEngine {
    async fn write(&self, series_key: &str, sample: &Sample, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let hash = hash_series(series_key);
        let key = encode_key(hash, sample.timestamp_nanos);
        let value = Self::encode_sample(sample)?;

        self.blocking(move |db| {
            db.put(&key, &value)
                .map_err(|e| TinyObsError::StorageUnavailable(format!("put failed: {e}")))
        })
        .await
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

        let rows = self
            .blocking(move |db| {
                db.scan(&lo, &hi)
                    .map_err(|e| TinyObsError::StorageUnavailable(format!("scan failed: {e}")))
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (i, (_, bytes)) in rows.into_iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            out.push(Self::decode_sample(&bytes)?);
        }
        Ok(out)
    }

    async fn scan_all(&self, range: TimeRange, cancel: &CancelToken) -> Result<Vec<Sample>> {
        cancel.check()?;
        let lo = [0u8; 16];
        let hi = [0xFFu8; 16];

        let rows = self
            .blocking(move |db| {
                db.scan(&lo, &hi)
                    .map_err(|e| TinyObsError::StorageUnavailable(format!("scan failed: {e}")))
            })
            .await?;

        let mut out = Vec::new();
        for (i, (key, bytes)) in rows.into_iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            let Some((_, ts)) = super::keys::decode_key(&key) else {
                continue;
            };
            if ts < range.start_nanos || ts >= range.end_nanos {
                continue;
            }
            out.push(Self::decode_sample(&bytes)?);
        }
        Ok(out)
    }

    async fn delete_range(&self, series_key: &str, range: TimeRange, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let hash = hash_series(series_key);
        let lo = encode_key(hash, range.start_nanos);
        let hi = encode_key(hash, range.end_nanos);

        self.blocking(move |db| {
            db.delete_range(&lo, &hi)
                .map_err(|e| TinyObsError::StorageUnavailable(format!("delete_range failed: {e}")))
        })
        .await
    }

    async fn delete(&self, before_nanos: i64, resolution: Option<Resolution>, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let lo = [0u8; 16];
        let hi = [0xFFu8; 16];

        let rows = self
            .blocking(move |db| {
                db.scan(&lo, &hi)
                    .map_err(|e| TinyObsError::StorageUnavailable(format!("scan failed: {e}")))
            })
            .await?;

        let mut doomed = Vec::new();
        for (i, (key, bytes)) in rows.into_iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            let Some((_, ts)) = super::keys::decode_key(&key) else {
                continue;
            };
            if ts >= before_nanos {
                continue;
            }
            if let Some(want) = resolution {
                let Ok(sample) = Self::decode_sample(&bytes) else {
                    continue;
                };
                if sample.resolution() != want {
                    continue;
                }
            }
            doomed.push(key);
        }

        self.blocking(move |db| {
            for key in &doomed {
                db.delete(key)
                    .map_err(|e| TinyObsError::StorageUnavailable(format!("delete failed: {e}")))?;
            }
            Ok(())
        })
        .await
    }

    async fn stats(&self, cancel: &CancelToken) -> Result<StorageStats> {
        cancel.check()?;
        let lo = [0u8; 16];
        let hi = [0xFFu8; 16];

        let rows = self
            .blocking(move |db| {
                db.scan(&lo, &hi)
                    .map_err(|e| TinyObsError::StorageUnavailable(format!("scan failed: {e}")))
            })
            .await?;

        let mut total_samples = 0u64;
        let mut series_hashes: std::collections::HashSet<u64> = std::collections::HashSet::new();
        let mut oldest_ts: Option<i64> = None;
        let mut newest_ts: Option<i64> = None;
        for (i, (key, _bytes)) in rows.iter().enumerate() {
            if i % 1000 == 0 {
                cancel.check()?;
            }
            let Some((hash, ts)) = super::keys::decode_key(key) else {
                continue;
            };
            total_samples += 1;
            series_hashes.insert(hash);
            oldest_ts = Some(oldest_ts.map_or(ts, |o| o.min(ts)));
            newest_ts = Some(newest_ts.map_or(ts, |n| n.max(ts)));
        }

        let data_dir = self.data_dir.clone();
        let size_bytes = tokio::task::spawn_blocking(move || Self::dir_size(std::path::Path::new(&data_dir)))
            .await
            .map_err(|e| TinyObsError::StorageUnavailable(format!("blocking task panicked: {e}")))?
            .map_err(|e| TinyObsError::StorageUnavailable(format!("stat failed: {e}")))?;

        Ok(StorageStats {
            total_samples,
            total_series: series_hashes.len() as u64,
            size_bytes,
            oldest_ts,
            newest_ts,
        })
    }

    async fn run_gc(&self, cancel: &CancelToken) -> Result<GcOutcome> {
        cancel.check()?;
        let before = self.stats(cancel).await?.size_bytes;
        self.blocking(|db| {
            db.major_compact()
                .map_err(|e| TinyObsError::StorageUnavailable(format!("major_compact failed: {e}")))
        })
        .await?;
        let after = self.stats(cancel).await?.size_bytes;
        Ok(if after < before {
            GcOutcome::Reclaimed
        } else {
            GcOutcome::NoReclaim
        })
    }

    async fn close(&self) -> Result<()> {
        self.blocking(|db| {
            db.close()
                .map_err(|e| TinyObsError::StorageUnavailable(format!("close failed: {e}")))
        })
        .await
    }
}
