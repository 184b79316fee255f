//! Sample and series-identity types shared by every core subsystem.

use std::collections::BTreeMap;

/// Maximum byte length of a metric name.
pub const MAX_NAME_LEN: usize = 256;
/// Maximum number of labels on a sample.
pub const MAX_LABELS: usize = 20;
/// Maximum byte length of a label key.
pub const MAX_LABEL_KEY_LEN: usize = 256;
/// Maximum byte length of a label value.
pub const MAX_LABEL_VALUE_LEN: usize = 1024;

/// Reserved label prefix carrying aggregate metadata; never user-visible.
pub const RESERVED_PREFIX: char = '_';

pub const LABEL_RESOLUTION: &str = "__resolution__";
pub const LABEL_SUM: &str = "__sum__";
pub const LABEL_COUNT: &str = "__count__";
pub const LABEL_MIN: &str = "__min__";
pub const LABEL_MAX: &str = "__max__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    Counter,
    Gauge,
    Histogram,
}

/// A resolution a sample can be stored at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Raw,
    FiveMin,
    OneHour,
}

impl Resolution {
    pub fn as_label(self) -> Option<&'static str> {
        match self {
            Resolution::Raw => None,
            Resolution::FiveMin => Some("5m"),
            Resolution::OneHour => Some("1h"),
        }
    }

    pub fn from_label(value: &str) -> Option<Resolution> {
        match value {
            "5m" => Some(Resolution::FiveMin),
            "1h" => Some(Resolution::OneHour),
            _ => None,
        }
    }
}

/// An immutable observation: name, type, value, labels, timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Sample {
    pub name: String,
    #[serde(rename = "type")]
    pub sample_type: SampleType,
    pub value: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Absolute instant, nanosecond resolution since the Unix epoch.
    pub timestamp_nanos: i64,
}

impl Sample {
    /// User-visible labels, excluding reserved (`_`-prefixed) metadata.
    pub fn user_labels(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .filter(|(k, _)| !k.starts_with(RESERVED_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The resolution this sample is stored at, derived from `__resolution__`.
    pub fn resolution(&self) -> Resolution {
        self.labels
            .get(LABEL_RESOLUTION)
            .and_then(|v| Resolution::from_label(v))
            .unwrap_or(Resolution::Raw)
    }

    pub fn is_aggregate(&self) -> bool {
        self.labels.contains_key(LABEL_RESOLUTION)
    }

    /// Canonical series key: `name` followed by sorted `,k=v` segments over
    /// the user-visible labels. Two samples are the same logical series iff
    /// this string matches, regardless of which resolution each is stored
    /// at.
    pub fn series_key(&self) -> String {
        canonical_series_key(&self.name, &self.user_labels())
    }

    /// Canonical storage key: `name` followed by sorted `,k=v` segments
    /// over *all* labels, reserved metadata included. Raw samples carry no
    /// reserved labels so this equals `series_key()` for them; aggregate
    /// samples always carry at least `__resolution__`, so an aggregate's
    /// storage key never collides with the raw series it was built from
    /// even when their timestamps coincide exactly.
    pub fn storage_key(&self) -> String {
        canonical_series_key(&self.name, &self.labels)
    }

    /// Validate name/label bounds and reject reserved-label misuse: `_`
    /// -prefixed label keys are aggregate metadata and must never
    /// originate from a user-submitted sample.
    pub fn validate(&self) -> Result<(), crate::error::TinyObsError> {
        use crate::error::TinyObsError;

        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(TinyObsError::InvalidSample(format!(
                "name must be 1..={MAX_NAME_LEN} bytes, got {}",
                self.name.len()
            )));
        }
        if self.labels.len() > MAX_LABELS {
            return Err(TinyObsError::InvalidSample(format!(
                "at most {MAX_LABELS} labels allowed, got {}",
                self.labels.len()
            )));
        }
        for (k, v) in &self.labels {
            if k.starts_with(RESERVED_PREFIX) {
                return Err(TinyObsError::InvalidSample(format!(
                    "label key '{k}' is reserved and cannot be set by a caller"
                )));
            }
            if k.is_empty() || k.len() > MAX_LABEL_KEY_LEN {
                return Err(TinyObsError::InvalidSample(format!(
                    "label key '{k}' exceeds {MAX_LABEL_KEY_LEN} bytes"
                )));
            }
            if v.len() > MAX_LABEL_VALUE_LEN {
                return Err(TinyObsError::InvalidSample(format!(
                    "label value for '{k}' exceeds {MAX_LABEL_VALUE_LEN} bytes"
                )));
            }
        }
        Ok(())
    }
}

/// Build the canonical series key for a (name, user-visible labels) pair.
/// `labels` must already exclude reserved metadata.
pub fn canonical_series_key(name: &str, labels: &BTreeMap<String, String>) -> String {
    let mut key = String::with_capacity(name.len() + labels.len() * 16);
    key.push_str(name);
    for (k, v) in labels {
        key.push(',');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

/// Build an aggregate sample from bucket accumulator values.
pub fn make_aggregate_sample(
    name: &str,
    user_labels: &BTreeMap<String, String>,
    bucket_start_nanos: i64,
    resolution: Resolution,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
) -> Sample {
    let mut labels = user_labels.clone();
    if let Some(res) = resolution.as_label() {
        labels.insert(LABEL_RESOLUTION.to_string(), res.to_string());
    }
    labels.insert(LABEL_SUM.to_string(), sum.to_string());
    labels.insert(LABEL_COUNT.to_string(), count.to_string());
    labels.insert(LABEL_MIN.to_string(), min.to_string());
    labels.insert(LABEL_MAX.to_string(), max.to_string());

    Sample {
        name: name.to_string(),
        sample_type: SampleType::Gauge,
        value: if count > 0 { sum / count as f64 } else { 0.0 },
        labels,
        timestamp_nanos: bucket_start_nanos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn series_key_sorts_labels() {
        let a = canonical_series_key("cpu", &labels(&[("b", "2"), ("a", "1")]));
        let b = canonical_series_key("cpu", &labels(&[("a", "1"), ("b", "2")]));
        assert_eq!(a, b);
        assert_eq!(a, "cpu,a=1,b=2");
    }

    #[test]
    fn user_labels_excludes_reserved() {
        let s = Sample {
            name: "cpu".into(),
            sample_type: SampleType::Gauge,
            value: 1.0,
            labels: labels(&[("host", "a"), ("__resolution__", "5m")]),
            timestamp_nanos: 0,
        };
        let ul = s.user_labels();
        assert_eq!(ul.len(), 1);
        assert!(ul.contains_key("host"));
    }

    #[test]
    fn validate_rejects_empty_name() {
        let s = Sample {
            name: String::new(),
            sample_type: SampleType::Gauge,
            value: 1.0,
            labels: BTreeMap::new(),
            timestamp_nanos: 0,
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_reserved_label_keys() {
        let s = Sample {
            name: "cpu".into(),
            sample_type: SampleType::Gauge,
            value: 1.0,
            labels: labels(&[("__resolution__", "5m")]),
            timestamp_nanos: 0,
        };
        assert!(matches!(s.validate(), Err(crate::error::TinyObsError::InvalidSample(_))));
    }

    #[test]
    fn storage_key_differs_from_series_key_for_aggregates() {
        let s = Sample {
            name: "cpu".into(),
            sample_type: SampleType::Gauge,
            value: 1.0,
            labels: labels(&[("host", "a"), ("__resolution__", "5m")]),
            timestamp_nanos: 0,
        };
        assert_ne!(s.series_key(), s.storage_key());
        assert_eq!(s.series_key(), "cpu,host=a");
    }

    #[test]
    fn validate_rejects_too_many_labels() {
        let mut labels = BTreeMap::new();
        for i in 0..=MAX_LABELS {
            labels.insert(format!("k{i}"), "v".to_string());
        }
        let s = Sample {
            name: "m".into(),
            sample_type: SampleType::Gauge,
            value: 1.0,
            labels,
            timestamp_nanos: 0,
        };
        assert!(s.validate().is_err());
    }
}
