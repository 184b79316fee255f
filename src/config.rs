use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `tinyobs.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TinyObsConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cardinality: CardinalityConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_memtable_bytes")]
    pub memtable_bytes: u64,
    #[serde(default)]
    pub block_cache_bytes: Option<u64>,
    #[serde(default)]
    pub index_cache_bytes: Option<u64>,
    #[serde(default = "default_value_log_segment_bytes")]
    pub value_log_segment_bytes: u64,
    #[serde(default = "default_level0_stall_tables")]
    pub level0_stall_tables: u32,
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
    /// Maximum bytes the data directory may occupy before ingest rejects
    /// writes with `StorageFull`. Overridden by `TINYOBS_MAX_STORAGE_GB`.
    #[serde(default = "default_max_storage_bytes")]
    pub max_storage_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            memtable_bytes: default_memtable_bytes(),
            block_cache_bytes: None,
            index_cache_bytes: None,
            value_log_segment_bytes: default_value_log_segment_bytes(),
            level0_stall_tables: default_level0_stall_tables(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            max_storage_bytes: default_max_storage_bytes(),
        }
    }
}

impl StorageConfig {
    pub fn block_cache_bytes(&self) -> u64 {
        self.block_cache_bytes.unwrap_or(self.memtable_bytes / 2)
    }

    pub fn index_cache_bytes(&self) -> u64 {
        self.index_cache_bytes.unwrap_or(self.memtable_bytes / 4)
    }
}

fn default_data_dir() -> String {
    "./data/tinyobs".to_string()
}
fn default_memtable_bytes() -> u64 {
    16 * 1024 * 1024
}
fn default_value_log_segment_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_level0_stall_tables() -> u32 {
    4
}
fn default_slow_query_threshold_ms() -> u64 {
    5_000
}
fn default_max_storage_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB, matches TINYOBS_MAX_STORAGE_GB default of 1
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardinalityConfig {
    #[serde(default = "default_max_unique_series")]
    pub max_unique_series: u64,
    #[serde(default = "default_max_series_per_metric")]
    pub max_series_per_metric: u64,
}

impl Default for CardinalityConfig {
    fn default() -> Self {
        Self {
            max_unique_series: default_max_unique_series(),
            max_series_per_metric: default_max_series_per_metric(),
        }
    }
}

fn default_max_unique_series() -> u64 {
    1_000_000
}
fn default_max_series_per_metric() -> u64 {
    100_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_metrics_per_request")]
    pub max_metrics_per_request: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_metrics_per_request: default_max_metrics_per_request(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_max_metrics_per_request() -> usize {
    1_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_compaction_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_raw_retention_days")]
    pub raw_retention_days: u32,
    #[serde(default = "default_5m_retention_days")]
    pub five_min_retention_days: u32,
    #[serde(default = "default_1h_retention_days")]
    pub one_hour_retention_days: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_compaction_interval_secs(),
            raw_retention_days: default_raw_retention_days(),
            five_min_retention_days: default_5m_retention_days(),
            one_hour_retention_days: default_1h_retention_days(),
        }
    }
}

fn default_compaction_interval_secs() -> u64 {
    3_600
}
fn default_raw_retention_days() -> u32 {
    14
}
fn default_5m_retention_days() -> u32 {
    90
}
fn default_1h_retention_days() -> u32 {
    365
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_max_samples")]
    pub max_samples: u64,
    #[serde(default = "default_step_secs")]
    pub default_step_secs: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_samples: default_max_samples(),
            default_step_secs: default_step_secs(),
        }
    }
}

fn default_max_samples() -> u64 {
    1_000_000 // local-dev default; production reference is 50_000_000
}
fn default_step_secs() -> f64 {
    15.0
}

impl TinyObsConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::apply_env_overrides(Self::default()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: TinyObsConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(Self::apply_env_overrides(config))
    }

    /// Apply environment overrides, which take precedence over the TOML
    /// file.
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(gb) = std::env::var("TINYOBS_MAX_STORAGE_GB") {
            if let Ok(gb) = gb.parse::<u64>() {
                self.storage.max_storage_bytes = gb * 1024 * 1024 * 1024;
            }
        }
        // TINYOBS_MAX_MEMORY_MB (0 = auto) sizes the memtable when set and nonzero.
        if let Ok(mb) = std::env::var("TINYOBS_MAX_MEMORY_MB") {
            if let Ok(mb) = mb.parse::<u64>() {
                if mb > 0 {
                    self.storage.memtable_bytes = mb * 1024 * 1024;
                }
            }
        }
        self
    }

    pub fn http_port(&self) -> String {
        std::env::var("PORT").unwrap_or_else(|_| "8080".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = TinyObsConfig::default();
        assert_eq!(cfg.cardinality.max_unique_series, 1_000_000);
        assert_eq!(cfg.compaction.raw_retention_days, 14);
        assert_eq!(cfg.compaction.five_min_retention_days, 90);
        assert_eq!(cfg.compaction.one_hour_retention_days, 365);
        assert_eq!(cfg.storage.block_cache_bytes(), 8 * 1024 * 1024);
        assert_eq!(cfg.storage.index_cache_bytes(), 4 * 1024 * 1024);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = TinyObsConfig::load("/nonexistent/path/tinyobs.toml").unwrap();
        assert_eq!(cfg.ingest.max_metrics_per_request, 1_000);
    }
}
