//! Cached disk-usage probe. A single mutex guards both the cached value
//! and its refresh so two concurrent callers past the cache window can't
//! both recompute.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(10);

struct Cached {
    used_bytes: u64,
    refreshed_at: Instant,
}

pub struct StorageMonitor {
    data_dir: PathBuf,
    cache_duration: Duration,
    max_bytes: u64,
    cache: Mutex<Option<Cached>>,
}

impl StorageMonitor {
    pub fn new(data_dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_duration: DEFAULT_CACHE_DURATION,
            max_bytes,
            cache: Mutex::new(None),
        }
    }

    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Current bytes used under the data directory, refreshing if the
    /// cached value is past `cache_duration`.
    pub fn used_bytes(&self) -> u64 {
        let mut cache = self.cache.lock().unwrap();
        if let Some(c) = cache.as_ref() {
            if c.refreshed_at.elapsed() < self.cache_duration {
                return c.used_bytes;
            }
        }
        let used_bytes = Self::scan_dir(&self.data_dir);
        *cache = Some(Cached {
            used_bytes,
            refreshed_at: Instant::now(),
        });
        used_bytes
    }

    pub fn is_full(&self) -> bool {
        self.used_bytes() >= self.max_bytes
    }

    /// Actual on-disk bytes, not logical size, so sparse files are
    /// measured correctly. POSIX reports this as `blocks * 512`; non-unix
    /// targets fall back to logical length.
    fn scan_dir(path: &std::path::Path) -> u64 {
        let mut total = 0u64;
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                total += Self::scan_dir(&entry.path());
            } else {
                total += Self::file_disk_usage(&meta);
            }
        }
        total
    }

    #[cfg(unix)]
    fn file_disk_usage(meta: &std::fs::Metadata) -> u64 {
        meta.blocks() * 512
    }

    #[cfg(not(unix))]
    fn file_disk_usage(meta: &std::fs::Metadata) -> u64 {
        meta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dir_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = StorageMonitor::new(dir.path(), 1024);
        assert_eq!(monitor.used_bytes(), 0);
        assert!(!monitor.is_full());
    }

    #[test]
    fn reports_nonzero_after_write() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.dat"), vec![0u8; 8192]).unwrap();
        let monitor = StorageMonitor::new(dir.path(), 1024 * 1024);
        assert!(monitor.used_bytes() > 0);
    }

    #[test]
    fn is_full_once_over_max() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.dat"), vec![0u8; 8192]).unwrap();
        let monitor = StorageMonitor::new(dir.path(), 1);
        assert!(monitor.is_full());
    }

    #[test]
    fn caches_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = StorageMonitor::new(dir.path(), 1024 * 1024)
            .with_cache_duration(Duration::from_secs(60));
        let first = monitor.used_bytes();
        std::fs::write(dir.path().join("a.dat"), vec![0u8; 8192]).unwrap();
        let second = monitor.used_bytes();
        assert_eq!(first, second);
    }
}
