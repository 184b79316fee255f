//! Lifecycle supervisor: background compaction,
//! GC, and broadcaster loops sharing one cancellation signal, plus the
//! compaction health monitor the `/healthz` endpoint reads.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::compactor::Compactor;
use crate::config::CompactionConfig;
use crate::error::GcOutcome;
use crate::storage::StorageEngine;

const COMPACTION_RETRY_BACKOFFS_SECS: [u64; 3] = [30, 60, 120];
const GC_INTERVAL: Duration = Duration::from_secs(10 * 60);
const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
const BROADCAST_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Current time, in nanoseconds since the Unix epoch. Isolated behind a
/// function so background loops (and their tests) don't call
/// `SystemTime::now()` directly all over the place.
fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Records compaction health behind a reader-writer lock; the health
/// endpoint only ever takes a read lock.
#[derive(Default)]
struct CompactionMonitorInner {
    last_success_nanos: Option<i64>,
    last_attempt_nanos: Option<i64>,
    consecutive_errors: u32,
    last_error: Option<String>,
}

pub struct CompactionMonitor {
    inner: RwLock<CompactionMonitorInner>,
}

#[derive(Debug, Clone)]
pub struct CompactionStatus {
    pub healthy: bool,
    pub last_success_nanos: Option<i64>,
    pub last_attempt_nanos: Option<i64>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

impl CompactionMonitor {
    pub fn new() -> Self {
        Self { inner: RwLock::new(CompactionMonitorInner::default()) }
    }

    async fn record_attempt(&self) {
        self.inner.write().await.last_attempt_nanos = Some(now_nanos());
    }

    async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.last_success_nanos = Some(now_nanos());
        inner.consecutive_errors = 0;
        inner.last_error = None;
    }

    async fn record_error(&self, error: String) {
        let mut inner = self.inner.write().await;
        inner.consecutive_errors += 1;
        inner.last_error = Some(error);
    }

    pub async fn status(&self) -> CompactionStatus {
        let inner = self.inner.read().await;
        let healthy = inner
            .last_success_nanos
            .is_some_and(|t| now_nanos() - t <= 3600 * 1_000_000_000)
            && inner.consecutive_errors <= 3;
        CompactionStatus {
            healthy,
            last_success_nanos: inner.last_success_nanos,
            last_attempt_nanos: inner.last_attempt_nanos,
            consecutive_errors: inner.consecutive_errors,
            last_error: inner.last_error.clone(),
        }
    }
}

pub struct Supervisor {
    pub compaction_monitor: Arc<CompactionMonitor>,
    cancel: CancelToken,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn the compaction, GC, and broadcaster loops. Cancelling
    /// `cancel` is the only supported way to stop them; callers MUST
    /// cancel before waiting on the returned handles.
    pub fn spawn(storage: Arc<dyn StorageEngine>, config: CompactionConfig, cancel: CancelToken) -> Self {
        let compaction_monitor = Arc::new(CompactionMonitor::new());

        let mut handles = Vec::new();
        handles.push(tokio::spawn(compaction_loop(
            storage.clone(),
            config,
            compaction_monitor.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(gc_loop(storage, cancel.clone())));

        Self { compaction_monitor, cancel, handles }
    }

    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Wait for all workers to stop, with a final timeout so shutdown
    /// can't hang forever.
    pub async fn wait(self, timeout: Duration) {
        let joined = tokio::time::timeout(timeout, futures_join_all(self.handles)).await;
        if joined.is_err() {
            tracing::warn!("supervisor: worker shutdown timed out after {timeout:?}");
        }
    }
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("supervisor: worker task panicked: {e}");
        }
    }
}

async fn compaction_loop(
    storage: Arc<dyn StorageEngine>,
    config: CompactionConfig,
    monitor: Arc<CompactionMonitor>,
    cancel: CancelToken,
) {
    let compactor = Compactor::new(storage);
    run_compaction_attempt(&compactor, &monitor, &cancel).await;

    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
    interval.tick().await; // consume the immediate first tick

    loop {
        interval.tick().await;
        if cancel.is_cancelled() {
            break;
        }
        run_compaction_attempt(&compactor, &monitor, &cancel).await;
    }
    tracing::info!("compaction loop stopped");
}

async fn run_compaction_attempt(compactor: &Compactor, monitor: &Arc<CompactionMonitor>, cancel: &CancelToken) {
    monitor.record_attempt().await;

    for (attempt, backoff_secs) in std::iter::once(0).chain(COMPACTION_RETRY_BACKOFFS_SECS).enumerate() {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        }
        match compactor.compact_and_cleanup(now_nanos(), cancel).await {
            Ok((five_min, one_hour)) => {
                tracing::info!(five_min_buckets = five_min, one_hour_buckets = one_hour, "compaction cycle complete");
                monitor.record_success().await;
                return;
            }
            Err(e) => {
                tracing::warn!("compaction attempt {attempt} failed: {e}");
                monitor.record_error(e.to_string()).await;
            }
        }
    }

    let status = monitor.status().await;
    if status.consecutive_errors > 3 {
        tracing::error!(
            consecutive_errors = status.consecutive_errors,
            "ALERT: compaction has failed {} times in a row",
            status.consecutive_errors
        );
    }
}

async fn gc_loop(storage: Arc<dyn StorageEngine>, cancel: CancelToken) {
    let mut interval = tokio::time::interval(GC_INTERVAL);
    loop {
        interval.tick().await;
        if cancel.is_cancelled() {
            break;
        }
        match storage.run_gc(&cancel).await {
            Ok(GcOutcome::Reclaimed) => tracing::info!("gc loop: reclaimed space"),
            Ok(GcOutcome::NoReclaim) => tracing::debug!("gc loop: nothing to reclaim"),
            Err(e) => tracing::warn!("gc loop error: {e}"),
        }
    }
    tracing::info!("gc loop stopped");
}

/// Subscriber registry for the broadcaster loop. Guarded by a single
/// mutex; broadcasting takes a read lock, collects subscribers whose
/// channel is closed, and removes them only after releasing the lock, to
/// avoid lock-order inversion with unregistration.
pub struct Broadcaster {
    subscribers: std::sync::Mutex<Vec<tokio::sync::mpsc::UnboundedSender<Vec<crate::model::Sample>>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self { subscribers: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Vec<crate::model::Sample>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn publish(&self, samples: &[crate::model::Sample]) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        let mut dead = Vec::new();
        for (i, tx) in subscribers.iter().enumerate() {
            if tx.send(samples.to_vec()).is_err() {
                dead.push(i);
            }
        }
        if !dead.is_empty() {
            let mut guard = self.subscribers.lock().unwrap();
            for i in dead.into_iter().rev() {
                guard.remove(i);
            }
        }
    }

    fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().unwrap().is_empty()
    }
}

/// Spawn the broadcaster loop: every 5s, if there are live
/// subscribers, query the last minute (limit 1000) and publish. Backs
/// off exponentially on error, 1s up to a 5 minute ceiling, logging
/// recovery on the next success.
pub fn spawn_broadcaster(
    storage: Arc<dyn StorageEngine>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        let mut was_failing = false;

        loop {
            tokio::time::sleep(BROADCAST_INTERVAL).await;
            if cancel.is_cancelled() {
                break;
            }
            if !broadcaster.has_subscribers() {
                continue;
            }

            let end = now_nanos();
            let start = end - 60 * 1_000_000_000;
            match storage
                .scan_all(crate::storage::TimeRange { start_nanos: start, end_nanos: end }, &cancel)
                .await
            {
                Ok(mut samples) => {
                    samples.truncate(1000);
                    broadcaster.publish(&samples);
                    backoff = Duration::from_secs(1);
                    if was_failing {
                        tracing::info!("broadcaster loop: recovered");
                        was_failing = false;
                    }
                }
                Err(e) => {
                    tracing::warn!("broadcaster loop error (backing off {backoff:?}): {e}");
                    was_failing = true;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BROADCAST_MAX_BACKOFF);
                }
            }
        }
        tracing::info!("broadcaster loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_unhealthy_before_first_success() {
        let monitor = CompactionMonitor::new();
        let status = monitor.status().await;
        assert!(!status.healthy);
    }

    #[tokio::test]
    async fn monitor_healthy_after_success() {
        let monitor = CompactionMonitor::new();
        monitor.record_success().await;
        let status = monitor.status().await;
        assert!(status.healthy);
        assert_eq!(status.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn monitor_unhealthy_after_too_many_errors() {
        let monitor = CompactionMonitor::new();
        monitor.record_success().await;
        for _ in 0..4 {
            monitor.record_error("boom".into()).await;
        }
        let status = monitor.status().await;
        assert!(!status.healthy);
        assert_eq!(status.consecutive_errors, 4);
    }

    #[test]
    fn broadcaster_starts_with_no_subscribers() {
        let b = Broadcaster::new();
        assert!(!b.has_subscribers());
    }

    #[test]
    fn broadcaster_tracks_subscription() {
        let b = Broadcaster::new();
        let _rx = b.subscribe();
        assert!(b.has_subscribers());
    }
}
