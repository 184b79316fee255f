//! Cardinality admission control. Tracks the set of distinct
//! series seen per metric and overall, rejecting new series once either
//! bound is exceeded. Reserved (`_`-prefixed) labels never factor into the
//! tracked key, so aggregate writeback never contributes to cardinality.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::config::CardinalityConfig;
use crate::error::{Result, TinyObsError};

#[derive(Debug, Clone, Copy, Default)]
pub struct CardinalityStats {
    pub total_series: u64,
    pub metrics_tracked: u64,
}

pub struct CardinalityTracker {
    config: CardinalityConfig,
    // metric name -> set of canonical series keys seen for that metric
    by_metric: Mutex<HashMap<String, HashSet<String>>>,
}

impl CardinalityTracker {
    pub fn new(config: CardinalityConfig) -> Self {
        Self {
            config,
            by_metric: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Ok(())` if admitting `series_key` under `metric_name` would
    /// stay within both the global and per-metric series limits. Does not
    /// record the series; call [`Self::record`] after a successful write.
    pub fn check(&self, metric_name: &str, series_key: &str) -> Result<()> {
        let by_metric = self.by_metric.lock().unwrap();

        if let Some(series) = by_metric.get(metric_name) {
            if !series.contains(series_key) && series.len() as u64 >= self.config.max_series_per_metric {
                return Err(TinyObsError::CardinalityExceeded(format!(
                    "metric '{metric_name}' at max_series_per_metric ({})",
                    self.config.max_series_per_metric
                )));
            }
        }

        let total: u64 = by_metric.values().map(|s| s.len() as u64).sum();
        let is_new_series = !by_metric.get(metric_name).is_some_and(|s| s.contains(series_key));
        if is_new_series && total >= self.config.max_unique_series {
            return Err(TinyObsError::CardinalityExceeded(format!(
                "max_unique_series ({}) reached",
                self.config.max_unique_series
            )));
        }

        Ok(())
    }

    /// Record a successfully written series. Idempotent for series already seen.
    pub fn record(&self, metric_name: &str, series_key: &str) {
        let mut by_metric = self.by_metric.lock().unwrap();
        by_metric
            .entry(metric_name.to_string())
            .or_default()
            .insert(series_key.to_string());
    }

    pub fn stats(&self) -> CardinalityStats {
        let by_metric = self.by_metric.lock().unwrap();
        CardinalityStats {
            total_series: by_metric.values().map(|s| s.len() as u64).sum(),
            metrics_tracked: by_metric.len() as u64,
        }
    }

    /// Per-metric series counts, for the `/v1/cardinality` response.
    pub fn by_metric_counts(&self) -> Vec<(String, u64)> {
        let by_metric = self.by_metric.lock().unwrap();
        let mut out: Vec<(String, u64)> = by_metric
            .iter()
            .map(|(name, series)| (name.clone(), series.len() as u64))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn utilization_pct(&self) -> f64 {
        let total = self.stats().total_series as f64;
        if self.config.max_unique_series == 0 {
            return 0.0;
        }
        (total / self.config.max_unique_series as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_unique: u64, max_per_metric: u64) -> CardinalityConfig {
        CardinalityConfig {
            max_unique_series: max_unique,
            max_series_per_metric: max_per_metric,
        }
    }

    #[test]
    fn admits_within_limits() {
        let tracker = CardinalityTracker::new(config(10, 10));
        assert!(tracker.check("cpu", "cpu,host=a").is_ok());
        tracker.record("cpu", "cpu,host=a");
        assert_eq!(tracker.stats().total_series, 1);
    }

    #[test]
    fn rejects_beyond_per_metric_limit() {
        let tracker = CardinalityTracker::new(config(100, 1));
        tracker.record("cpu", "cpu,host=a");
        assert!(tracker.check("cpu", "cpu,host=b").is_err());
    }

    #[test]
    fn rejects_beyond_global_limit() {
        let tracker = CardinalityTracker::new(config(1, 100));
        tracker.record("cpu", "cpu,host=a");
        assert!(tracker.check("mem", "mem,host=b").is_err());
    }

    #[test]
    fn existing_series_always_admitted() {
        let tracker = CardinalityTracker::new(config(1, 1));
        tracker.record("cpu", "cpu,host=a");
        assert!(tracker.check("cpu", "cpu,host=a").is_ok());
    }
}
