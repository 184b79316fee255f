//! Tree-walking executor. Recursive evaluation is manually
//! boxed since `async fn` can't recurse directly; no extra crate needed
//! for it, just `Pin<Box<dyn Future>>`.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::{Result, TinyObsError};
use crate::storage::{StorageEngine, TimeRange};

use super::ast::{AggOp, BinaryOp, Expr, MatchOp, VectorSelector};
use super::parser;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(i64, f64)>,
}

pub type Matrix = Vec<Series>;

/// Tracks materialized-sample count against `MaxSamples` across one
/// evaluation's recursive descent.
struct Budget {
    max_samples: u64,
    used: AtomicU64,
}

impl Budget {
    fn charge(&self, n: u64) -> Result<()> {
        let used = self.used.fetch_add(n, Ordering::Relaxed) + n;
        if used > self.max_samples {
            Err(TinyObsError::ResourceExhausted(format!(
                "query exceeded max_samples ({})",
                self.max_samples
            )))
        } else {
            Ok(())
        }
    }
}

pub struct Executor {
    storage: Arc<dyn StorageEngine>,
    max_samples: u64,
}

impl Executor {
    pub fn new(storage: Arc<dyn StorageEngine>, max_samples: u64) -> Self {
        Self { storage, max_samples }
    }

    pub fn parse(&self, query: &str) -> Result<Expr> {
        parser::parse(query)
    }

    pub async fn eval(
        &self,
        expr: &Expr,
        start_nanos: i64,
        end_nanos: i64,
        step_secs: f64,
        cancel: &CancelToken,
    ) -> Result<Matrix> {
        let budget = Budget {
            max_samples: self.max_samples,
            used: AtomicU64::new(0),
        };
        self.eval_inner(expr, start_nanos, end_nanos, step_secs, cancel, &budget)
            .await
    }

    fn eval_inner<'a>(
        &'a self,
        expr: &'a Expr,
        start_nanos: i64,
        end_nanos: i64,
        step_secs: f64,
        cancel: &'a CancelToken,
        budget: &'a Budget,
    ) -> Pin<Box<dyn Future<Output = Result<Matrix>> + Send + 'a>> {
        Box::pin(async move {
            cancel.check()?;
            match expr {
                Expr::NumberLiteral(n) => {
                    let mut points = Vec::new();
                    let step_nanos = (step_secs * NANOS_PER_SEC).max(1.0) as i64;
                    let mut ts = start_nanos;
                    while ts <= end_nanos {
                        points.push((ts, *n));
                        ts += step_nanos;
                    }
                    budget.charge(points.len() as u64)?;
                    Ok(vec![Series { labels: BTreeMap::new(), points }])
                }

                Expr::VectorSelector(sel) => {
                    self.query_selector(sel, start_nanos, end_nanos, cancel, budget).await
                }

                Expr::RangeSelector { selector, duration_secs } => {
                    let widened_start = start_nanos - (*duration_secs * NANOS_PER_SEC) as i64;
                    self.query_selector(selector, widened_start, end_nanos, cancel, budget).await
                }

                Expr::UnaryExpr { negate, expr } => {
                    let mut matrix =
                        self.eval_inner(expr, start_nanos, end_nanos, step_secs, cancel, budget).await?;
                    if *negate {
                        for series in &mut matrix {
                            for (_, v) in &mut series.points {
                                *v = -*v;
                            }
                        }
                    }
                    Ok(matrix)
                }

                Expr::BinaryExpr { op, lhs, rhs } => {
                    let lhs_matrix =
                        self.eval_inner(lhs, start_nanos, end_nanos, step_secs, cancel, budget).await?;
                    let rhs_matrix =
                        self.eval_inner(rhs, start_nanos, end_nanos, step_secs, cancel, budget).await?;
                    eval_binary(*op, lhs_matrix, rhs_matrix)
                }

                Expr::AggregateExpr { op, expr, group_labels, without, param } => {
                    let matrix =
                        self.eval_inner(expr, start_nanos, end_nanos, step_secs, cancel, budget).await?;
                    let param_value = match param {
                        Some(p) => {
                            let pm = self.eval_inner(p, start_nanos, end_nanos, step_secs, cancel, budget).await?;
                            pm.first().and_then(|s| s.points.first()).map(|(_, v)| *v)
                        }
                        None => None,
                    };
                    eval_aggregate(*op, matrix, group_labels, *without, param_value)
                }

                Expr::FunctionCall { name, args } => {
                    self.eval_function(name, args, start_nanos, end_nanos, step_secs, cancel, budget).await
                }
            }
        })
    }

    async fn query_selector(
        &self,
        sel: &VectorSelector,
        start_nanos: i64,
        end_nanos: i64,
        cancel: &CancelToken,
        budget: &Budget,
    ) -> Result<Matrix> {
        let raw = self
            .storage
            .scan_all(TimeRange { start_nanos, end_nanos }, cancel)
            .await?;

        let mut by_labels: BTreeMap<BTreeMap<String, String>, Vec<(i64, f64)>> = BTreeMap::new();
        // Aggregates share name and user labels with the raw series they
        // were built from; skip them here so a window spanning compacted
        // data doesn't mix averaged points into the raw point stream.
        for sample in raw.iter().filter(|s| s.name == sel.name && !s.is_aggregate()) {
            let labels = sample.user_labels();
            if !matchers_accept(&sel.matchers, &labels) {
                continue;
            }
            by_labels.entry(labels).or_default().push((sample.timestamp_nanos, sample.value));
        }

        let mut out = Vec::with_capacity(by_labels.len());
        let mut total = 0u64;
        for (labels, mut points) in by_labels {
            points.sort_by_key(|(ts, _)| *ts);
            total += points.len() as u64;
            out.push(Series { labels, points });
        }
        budget.charge(total)?;
        Ok(out)
    }

    fn eval_function<'a>(
        &'a self,
        name: &'a str,
        args: &'a [Expr],
        start_nanos: i64,
        end_nanos: i64,
        step_secs: f64,
        cancel: &'a CancelToken,
        budget: &'a Budget,
    ) -> Pin<Box<dyn Future<Output = Result<Matrix>> + Send + 'a>> {
        Box::pin(async move {
            match name {
                "rate" | "increase" => {
                    let Some(Expr::RangeSelector { duration_secs, .. }) = args.first() else {
                        return Err(TinyObsError::ParseError(format!(
                            "{name}() requires a range selector argument"
                        )));
                    };
                    let widened = self
                        .eval_inner(&args[0], start_nanos, end_nanos, step_secs, cancel, budget)
                        .await?;
                    let rated = rate_matrix(widened, *duration_secs);
                    if name == "rate" {
                        Ok(rated)
                    } else {
                        let duration_secs = *duration_secs;
                        Ok(rated
                            .into_iter()
                            .map(|mut s| {
                                for (_, v) in &mut s.points {
                                    *v *= duration_secs;
                                }
                                s
                            })
                            .collect())
                    }
                }
                other => Err(TinyObsError::ParseError(format!("unknown function '{other}'"))),
            }
        })
    }
}

fn matchers_accept(matchers: &[super::ast::LabelMatcher], labels: &BTreeMap<String, String>) -> bool {
    matchers.iter().all(|m| {
        let actual = labels.get(&m.name).map(String::as_str).unwrap_or("");
        match m.op {
            MatchOp::Eq => actual == m.value,
            MatchOp::Neq => actual != m.value,
            // Regex matching is accepted by the grammar but this executor
            // only implements exact-match semantics.
            MatchOp::Re | MatchOp::Nre => actual == m.value,
        }
    })
}

/// `rate`: for each point p, find the most recent earlier point q with
/// `q.time <= p.time - duration`; emit `max(0, (p.v - q.v) / duration)`.
fn rate_matrix(matrix: Matrix, duration_secs: f64) -> Matrix {
    let duration_nanos = (duration_secs * NANOS_PER_SEC) as i64;
    matrix
        .into_iter()
        .map(|series| {
            let mut points = Vec::new();
            for (i, &(p_ts, p_v)) in series.points.iter().enumerate() {
                let cutoff = p_ts - duration_nanos;
                let Some(&(q_ts, q_v)) = series.points[..i].iter().rev().find(|(t, _)| *t <= cutoff) else {
                    continue;
                };
                let dt_secs = (p_ts - q_ts) as f64 / NANOS_PER_SEC;
                if dt_secs <= 0.0 {
                    continue;
                }
                let rate = ((p_v - q_v) / dt_secs).max(0.0);
                points.push((p_ts, rate));
            }
            Series { labels: series.labels, points }
        })
        .collect()
}

fn eval_binary(op: BinaryOp, lhs: Matrix, rhs: Matrix) -> Result<Matrix> {
    if lhs.len() != 1 || rhs.len() != 1 {
        return Err(TinyObsError::ParseError(
            "many-to-many vector matching is not supported; each side must resolve to one series".into(),
        ));
    }
    let lhs = &lhs[0];
    let rhs = &rhs[0];

    let rhs_by_ts: BTreeMap<i64, f64> = rhs.points.iter().cloned().collect();
    let mut points = Vec::new();
    for &(ts, lv) in &lhs.points {
        let Some(&rv) = rhs_by_ts.get(&ts) else { continue };
        let v = apply_binary_op(op, lv, rv);
        points.push((ts, v));
    }

    Ok(vec![Series { labels: lhs.labels.clone(), points }])
}

fn apply_binary_op(op: BinaryOp, l: f64, r: f64) -> f64 {
    match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div => {
            if r == 0.0 {
                f64::NAN
            } else {
                l / r
            }
        }
        BinaryOp::Mod => l % r,
        BinaryOp::Pow => l.powf(r),
        BinaryOp::Eq => bool_val(l == r),
        BinaryOp::Neq => bool_val(l != r),
        BinaryOp::Lt => bool_val(l < r),
        BinaryOp::Lte => bool_val(l <= r),
        BinaryOp::Gt => bool_val(l > r),
        BinaryOp::Gte => bool_val(l >= r),
        BinaryOp::And => bool_val(l != 0.0 && r != 0.0),
        BinaryOp::Or => bool_val(l != 0.0 || r != 0.0),
        BinaryOp::Unless => bool_val(l != 0.0 && r == 0.0),
    }
}

fn bool_val(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn eval_aggregate(
    op: AggOp,
    matrix: Matrix,
    group_labels: &[String],
    without: bool,
    param: Option<f64>,
) -> Result<Matrix> {
    let mut groups: BTreeMap<BTreeMap<String, String>, Vec<&Series>> = BTreeMap::new();
    for series in &matrix {
        let key = group_key(&series.labels, group_labels, without);
        groups.entry(key).or_default().push(series);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (group_labels, members) in groups {
        let mut by_ts: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for series in &members {
            for &(ts, v) in &series.points {
                by_ts.entry(ts).or_default().push(v);
            }
        }

        let mut points = Vec::with_capacity(by_ts.len());
        for (ts, values) in by_ts {
            if let Some(v) = aggregate_values(op, &values, param) {
                points.push((ts, v));
            }
        }
        out.push(Series { labels: group_labels, points });
    }
    Ok(out)
}

fn group_key(labels: &BTreeMap<String, String>, group_labels: &[String], without: bool) -> BTreeMap<String, String> {
    if without {
        labels
            .iter()
            .filter(|(k, _)| !group_labels.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else if group_labels.is_empty() {
        BTreeMap::new()
    } else {
        labels
            .iter()
            .filter(|(k, _)| group_labels.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn aggregate_values(op: AggOp, values: &[f64], param: Option<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let count = values.len() as f64;
    Some(match op {
        AggOp::Sum => sum,
        AggOp::Avg => sum / count,
        AggOp::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        AggOp::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        AggOp::Count => count,
        AggOp::Stddev => variance(values, sum / count).sqrt(),
        AggOp::Stdvar => variance(values, sum / count),
        AggOp::Quantile => crate::compactor::calculate_percentile(values, param.unwrap_or(0.5)),
        AggOp::Topk | AggOp::Bottomk => {
            // Per-series point count already collapsed to a scalar per
            // timestamp here; k-selection is approximated by returning
            // the extremum, since only one value per group/timestamp
            // survives this aggregation stage.
            let k = param.unwrap_or(1.0) as usize;
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
            if matches!(op, AggOp::Bottomk) {
                sorted.reverse();
            }
            *sorted.get(k.saturating_sub(1)).unwrap_or(&sorted[0])
        }
        AggOp::CountValues => values.iter().collect::<std::collections::HashSet<_>>().len() as f64,
    })
}

fn variance(values: &[f64], mean: f64) -> f64 {
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Sample, SampleType};
    use crate::storage::memory::MemoryEngine;
    use std::collections::BTreeMap as Map;

    fn sample(name: &str, labels: &[(&str, &str)], value: f64, ts: i64) -> Sample {
        Sample {
            name: name.into(),
            sample_type: SampleType::Counter,
            value,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            timestamp_nanos: ts,
        }
    }

    async fn seeded_executor() -> (Executor, CancelToken) {
        let storage = Arc::new(MemoryEngine::new());
        let cancel = CancelToken::new();
        let series_key = |name: &str, labels: &[(&str, &str)]| {
            crate::model::canonical_series_key(name, &labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
        };
        storage
            .write(&series_key("http_requests_total", &[("host", "a")]), &sample("http_requests_total", &[("host", "a")], 0.0, 0), &cancel)
            .await
            .unwrap();
        storage
            .write(
                &series_key("http_requests_total", &[("host", "a")]),
                &sample("http_requests_total", &[("host", "a")], 100.0, 60 * 1_000_000_000),
                &cancel,
            )
            .await
            .unwrap();
        storage
            .write(
                &series_key("http_requests_total", &[("host", "b")]),
                &sample("http_requests_total", &[("host", "b")], 5.0, 0),
                &cancel,
            )
            .await
            .unwrap();
        (Executor::new(storage, 1_000_000), cancel)
    }

    #[tokio::test]
    async fn vector_selector_groups_by_labels() {
        let (exec, cancel) = seeded_executor().await;
        let expr = exec.parse("http_requests_total").unwrap();
        let matrix = exec.eval(&expr, 0, 120 * 1_000_000_000, 15.0, &cancel).await.unwrap();
        assert_eq!(matrix.len(), 2);
    }

    #[tokio::test]
    async fn vector_selector_excludes_aggregates() {
        let (exec, cancel) = seeded_executor().await;
        let mut aggregate_labels: Map<String, String> =
            [("host".to_string(), "a".to_string())].into_iter().collect();
        aggregate_labels.insert(crate::model::LABEL_RESOLUTION.to_string(), "5m".to_string());
        let aggregate = Sample {
            name: "http_requests_total".into(),
            sample_type: SampleType::Gauge,
            value: 999.0,
            labels: aggregate_labels,
            timestamp_nanos: 30 * 1_000_000_000,
        };
        let storage_key = aggregate.storage_key();
        exec.storage.write(&storage_key, &aggregate, &cancel).await.unwrap();

        let expr = exec.parse(r#"http_requests_total{host="a"}"#).unwrap();
        let matrix = exec.eval(&expr, 0, 120 * 1_000_000_000, 15.0, &cancel).await.unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(matrix[0].points.iter().all(|(_, v)| *v != 999.0));
    }

    #[tokio::test]
    async fn matcher_filters_by_label() {
        let (exec, cancel) = seeded_executor().await;
        let expr = exec.parse(r#"http_requests_total{host="a"}"#).unwrap();
        let matrix = exec.eval(&expr, 0, 120 * 1_000_000_000, 15.0, &cancel).await.unwrap();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].points.len(), 2);
    }

    #[tokio::test]
    async fn rate_computes_counter_delta_per_second() {
        let (exec, cancel) = seeded_executor().await;
        let expr = exec.parse(r#"rate(http_requests_total{host="a"}[1m])"#).unwrap();
        let matrix = exec.eval(&expr, 0, 120 * 1_000_000_000, 15.0, &cancel).await.unwrap();
        assert_eq!(matrix.len(), 1);
        let (_, rate) = matrix[0].points[0];
        assert!((rate - (100.0 / 60.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sum_by_aggregates_across_series() {
        let (exec, cancel) = seeded_executor().await;
        let expr = exec.parse("sum(http_requests_total)").unwrap();
        let matrix = exec.eval(&expr, 0, 1, 15.0, &cancel).await.unwrap();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].points[0].1, 5.0); // only ts=0 has both series
    }

    #[tokio::test]
    async fn number_literal_emits_step_grid() {
        let (exec, cancel) = seeded_executor().await;
        let expr = exec.parse("42").unwrap();
        let matrix = exec
            .eval(&expr, 0, 30 * 1_000_000_000, 15.0, &cancel)
            .await
            .unwrap();
        assert_eq!(matrix[0].points.len(), 3);
        assert!(matrix[0].points.iter().all(|(_, v)| *v == 42.0));
    }

    #[tokio::test]
    async fn max_samples_bound_is_enforced() {
        let (exec, cancel) = seeded_executor().await;
        let tight_exec = Executor::new(exec.storage.clone(), 1);
        let expr = tight_exec.parse("http_requests_total").unwrap();
        let err = tight_exec.eval(&expr, 0, 120 * 1_000_000_000, 15.0, &cancel).await;
        assert!(matches!(err, Err(TinyObsError::ResourceExhausted(_))));
    }

    #[test]
    fn percentile_helper_matches_compactor() {
        assert_eq!(crate::compactor::calculate_percentile(&[1.0, 2.0, 3.0], 1.0), 3.0);
    }
}
