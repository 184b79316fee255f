pub mod cancel;
pub mod cardinality;
pub mod compactor;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod lifecycle;
pub mod model;
pub mod query;
pub mod storage;
pub mod storage_monitor;

use std::sync::Arc;
use std::time::Instant;

use cardinality::CardinalityTracker;
use ingest::Ingestor;
use lifecycle::{Broadcaster, CompactionMonitor};
use query::Executor;
use storage::StorageEngine;
use storage_monitor::StorageMonitor;

/// Shared state handed to every handler. Cloning is cheap: every field is
/// an `Arc` (or `Copy`) over shared state, never owned data.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageEngine>,
    pub cardinality: Arc<CardinalityTracker>,
    pub storage_monitor: Arc<StorageMonitor>,
    pub compaction_monitor: Arc<CompactionMonitor>,
    pub executor: Arc<Executor>,
    pub ingestor: Arc<Ingestor>,
    pub broadcaster: Arc<Broadcaster>,
    pub started_at: Instant,
}
