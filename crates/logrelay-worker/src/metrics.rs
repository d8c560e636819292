//! Processing metrics
//!
//! Two operations are tracked through the `metrics` facade: end-to-end log
//! part processing and the broadcast publish inside it. Each has a latency
//! histogram and a failure counter.
//!
//! Every [`Metrics`] owns its recorder, so two pipelines in one process never
//! share counts. Workers record into lock-free storage; histogram samples are
//! folded into a quantile sketch whenever a snapshot is taken.

use metrics::{
    counter, describe_counter, describe_histogram, histogram, Counter, Gauge, Histogram, Key,
    KeyName, Metadata, Recorder, SharedString, Unit,
};
use metrics_util::registry::{AtomicStorage, Registry};
use metrics_util::storage::Summary;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

// ============================================================================
// Metric Names
// ============================================================================

/// End-to-end processing latency.
pub const PROCESS_LOG_PART: &str = "logs.process_log_part";

/// Log parts that failed at any stage.
pub const PROCESS_LOG_PART_FAILED: &str = "logs.process_log_part.failed";

/// Broadcast publish latency.
pub const PUSHER: &str = "logs.process_log_part.pusher";

/// Failed broadcast publishes.
pub const PUSHER_FAILED: &str = "logs.process_log_part.pusher.failed";

/// Quantiles reported for latency histograms.
pub const PERCENTILES: [f64; 5] = [0.5, 0.75, 0.95, 0.99, 0.999];

#[derive(Debug, Clone, Copy)]
enum Kind {
    Counter,
    Histogram,
}

/// Reporting order
const REGISTERED: [(&str, Kind); 4] = [
    (PROCESS_LOG_PART, Kind::Histogram),
    (PROCESS_LOG_PART_FAILED, Kind::Counter),
    (PUSHER, Kind::Histogram),
    (PUSHER_FAILED, Kind::Counter),
];

/// Describe every metric on the current recorder.
pub fn register_metrics() {
    describe_histogram!(
        PROCESS_LOG_PART,
        Unit::Seconds,
        "Time to parse, store and publish one log part"
    );
    describe_counter!(
        PROCESS_LOG_PART_FAILED,
        "Log parts that failed at any stage"
    );
    describe_histogram!(
        PUSHER,
        Unit::Seconds,
        "Time to publish one log part to Pusher"
    );
    describe_counter!(PUSHER_FAILED, "Pusher publishes that failed");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Recorder
// ============================================================================

struct RelayRecorder {
    registry: Registry<Key, AtomicStorage>,
    sketches: Mutex<HashMap<Key, Sketch>>,
    descriptions: Mutex<HashMap<String, String>>,
}

impl RelayRecorder {
    fn new() -> Self {
        Self {
            registry: Registry::new(AtomicStorage),
            sketches: Mutex::new(HashMap::new()),
            descriptions: Mutex::new(HashMap::new()),
        }
    }

    fn describe(&self, key: KeyName, description: SharedString) {
        lock(&self.descriptions).insert(key.as_str().to_owned(), String::from(&*description));
    }

    fn description(&self, name: &str) -> Option<String> {
        lock(&self.descriptions).get(name).cloned()
    }

    fn count(&self, key: &Key) -> u64 {
        self.registry
            .get_or_create_counter(key, |counter| counter.load(Ordering::Acquire))
    }

    /// Drain pending samples into the all-time sketch for `key`
    fn summarize(&self, key: &Key) -> Distribution {
        let bucket = self.registry.get_or_create_histogram(key, Arc::clone);
        let mut sketches = lock(&self.sketches);
        let sketch = sketches.entry(key.clone()).or_insert_with(Sketch::new);
        bucket.clear_with(|samples| {
            for &sample in samples {
                sketch.add(sample);
            }
        });
        sketch.distribution()
    }
}

impl Recorder for RelayRecorder {
    fn describe_counter(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.describe(key, description);
    }

    fn describe_gauge(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.describe(key, description);
    }

    fn describe_histogram(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.describe(key, description);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |counter| Counter::from_arc(Arc::clone(counter)))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |gauge| Gauge::from_arc(Arc::clone(gauge)))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |bucket| Histogram::from_arc(Arc::clone(bucket)))
    }
}

/// Quantile sketch plus the moments it does not keep
struct Sketch {
    summary: Summary,
    sum: f64,
    sum_sq: f64,
}

impl Sketch {
    fn new() -> Self {
        Self {
            summary: Summary::with_defaults(),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    fn add(&mut self, sample: f64) {
        self.summary.add(sample);
        self.sum += sample;
        self.sum_sq += sample * sample;
    }

    #[allow(clippy::cast_precision_loss)]
    fn distribution(&self) -> Distribution {
        if self.summary.is_empty() {
            return Distribution::default();
        }

        let n = self.summary.count() as f64;
        let mean = self.sum / n;
        Distribution {
            count: u64::try_from(self.summary.count()).unwrap_or(u64::MAX),
            min: self.summary.min(),
            max: self.summary.max(),
            mean,
            stddev: (self.sum_sq / n - mean * mean).max(0.0).sqrt(),
            quantiles: PERCENTILES.map(|q| self.summary.quantile(q).unwrap_or(0.0)),
        }
    }
}

/// Sketch statistics in seconds
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Distribution {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    stddev: f64,
    quantiles: [f64; 5],
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub count: u64,
    pub mean_rate: f64,
}

/// Latency distribution in seconds; `count` is all-time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean_rate: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

/// Snapshot of one registered metric
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricValue {
    Counter(CounterSnapshot),
    Histogram(HistogramSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub value: MetricValue,
}

// ============================================================================
// Metrics Handle
// ============================================================================

/// Metrics shared by every worker
pub struct Metrics {
    recorder: RelayRecorder,
    started: Instant,
    flushes: AtomicU64,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("started", &self.started)
            .field("flushes", &self.flushes())
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let metrics = Self {
            recorder: RelayRecorder::new(),
            started: Instant::now(),
            flushes: AtomicU64::new(0),
        };
        metrics.record(register_metrics);
        metrics
    }

    fn record<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(&self.recorder, f)
    }

    pub async fn time_processing<F: Future>(&self, fut: F) -> F::Output {
        let start = Instant::now();
        let output = fut.await;
        let elapsed = start.elapsed().as_secs_f64();
        self.record(|| histogram!(PROCESS_LOG_PART).record(elapsed));
        output
    }

    pub async fn time_publish<F: Future>(&self, fut: F) -> F::Output {
        let start = Instant::now();
        let output = fut.await;
        let elapsed = start.elapsed().as_secs_f64();
        self.record(|| histogram!(PUSHER).record(elapsed));
        output
    }

    pub fn mark_processing_failed(&self) {
        self.record(|| counter!(PROCESS_LOG_PART_FAILED).increment(1));
    }

    pub fn mark_publish_failed(&self) {
        self.record(|| counter!(PUSHER_FAILED).increment(1));
    }

    pub fn processed(&self) -> u64 {
        self.recorder
            .summarize(&Key::from_static_name(PROCESS_LOG_PART))
            .count
    }

    pub fn processing_failures(&self) -> u64 {
        self.recorder
            .count(&Key::from_static_name(PROCESS_LOG_PART_FAILED))
    }

    pub fn published(&self) -> u64 {
        self.recorder.summarize(&Key::from_static_name(PUSHER)).count
    }

    pub fn publish_failures(&self) -> u64 {
        self.recorder.count(&Key::from_static_name(PUSHER_FAILED))
    }

    /// Snapshots logged so far
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Every registered metric in reporting order
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let elapsed = self.started.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let rate = |count: u64| {
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };

        REGISTERED
            .iter()
            .map(|&(name, kind)| {
                let key = Key::from_static_name(name);
                let value = match kind {
                    Kind::Counter => {
                        let count = self.recorder.count(&key);
                        MetricValue::Counter(CounterSnapshot {
                            count,
                            mean_rate: rate(count),
                        })
                    }
                    Kind::Histogram => {
                        let d = self.recorder.summarize(&key);
                        let [p50, p75, p95, p99, p999] = d.quantiles;
                        MetricValue::Histogram(HistogramSnapshot {
                            count: d.count,
                            mean_rate: rate(d.count),
                            min: d.min,
                            max: d.max,
                            mean: d.mean,
                            stddev: d.stddev,
                            p50,
                            p75,
                            p95,
                            p99,
                            p999,
                        })
                    }
                };
                MetricSnapshot {
                    name,
                    description: self.recorder.description(name),
                    value,
                }
            })
            .collect()
    }
}

/// Log one line per metric and return what was logged
pub fn log_metrics(metrics: &Metrics) -> Vec<MetricSnapshot> {
    let snapshots = metrics.snapshot();
    for snapshot in &snapshots {
        match &snapshot.value {
            MetricValue::Counter(c) => info!(
                name = snapshot.name,
                kind = "counter",
                count = c.count,
                mean_rate = c.mean_rate,
                "metrics"
            ),
            MetricValue::Histogram(h) => info!(
                name = snapshot.name,
                kind = "histogram",
                count = h.count,
                mean_rate = h.mean_rate,
                min_secs = h.min,
                max_secs = h.max,
                mean_secs = h.mean,
                stddev_secs = h.stddev,
                median_secs = h.p50,
                p75_secs = h.p75,
                p95_secs = h.p95,
                p99_secs = h.p99,
                p999_secs = h.p999,
                "metrics"
            ),
        }
    }
    metrics.flushes.fetch_add(1, Ordering::AcqRel);
    snapshots
}

/// Log all metrics now and then once per `interval` until aborted
pub fn spawn_flush_loop(metrics: Arc<Metrics>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            log_metrics(&metrics);
        }
    })
}
