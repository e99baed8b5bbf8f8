//! Execution-time and counter reporting.
//!
//! The vault reports through an injected [`MetricsSink`]. [`TracingMetrics`]
//! emits samples as `tracing` events for a collector to scrape from logs;
//! [`RecordingMetrics`] keeps them in memory.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::debug;

pub const APPEND: &str = "append";
pub const SEARCH: &str = "search";
pub const LOAD_MIME_MESSAGE: &str = "loadMimeMessage";
pub const DELETE: &str = "delete";
pub const GC_DELETED_BUCKETS: &str = "gc.deletedBuckets";
pub const GC_DELETED_BLOBS: &str = "gc.deletedBlobs";

pub trait MetricsSink: Send + Sync {
    fn record_duration(&self, metric: &'static str, elapsed: Duration);
    fn increment(&self, metric: &'static str, by: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_duration(&self, metric: &'static str, elapsed: Duration) {
        debug!(
            metric,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "execution time"
        );
    }

    fn increment(&self, metric: &'static str, by: u64) {
        debug!(metric, by, "counter");
    }
}

#[derive(Debug, Default)]
pub struct RecordingMetrics {
    durations: Mutex<HashMap<&'static str, Vec<Duration>>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl RecordingMetrics {
    /// Number of timing samples recorded under `metric`.
    pub fn samples(&self, metric: &str) -> usize {
        self.durations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(metric)
            .map_or(0, Vec::len)
    }

    pub fn counter(&self, metric: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(metric)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_duration(&self, metric: &'static str, elapsed: Duration) {
        self.durations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(metric)
            .or_default()
            .push(elapsed);
    }

    fn increment(&self, metric: &'static str, by: u64) {
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(metric)
            .or_default() += by;
    }
}

/// Runs `fut` and records how long it took, whatever the outcome.
pub async fn timed<F, T>(sink: &dyn MetricsSink, metric: &'static str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let output = fut.await;
    sink.record_duration(metric, start.elapsed());
    output
}
