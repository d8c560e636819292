//! Worker pool behavior against the in-memory broker
//!
//! Covers the prefetch bound, unconditional acknowledgment, cooperative
//! shutdown and subscription failures.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use logrelay_worker::broadcast::MemoryBroadcaster;
use logrelay_worker::broker::{
    consume, BrokerState, MemoryBroker, MessageBroker, MessageProcessor, ProcessorFactory,
};
use logrelay_worker::error::{BoxError, BrokerError, ProcessError};
use logrelay_worker::metrics::{spawn_flush_loop, Metrics};
use logrelay_worker::processor::LogPartProcessor;
use logrelay_worker::store::MemoryStore;
use logrelay_worker::supervisor::supervise;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "reporting.jobs.logs";

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Debug, Default)]
struct Progress {
    started: AtomicUsize,
    finished: AtomicUsize,
}

struct SlowProcessor {
    delay: Duration,
    progress: Arc<Progress>,
}

#[async_trait]
impl MessageProcessor for SlowProcessor {
    async fn process(&mut self, _body: &[u8]) -> Result<(), ProcessError> {
        self.progress.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.progress.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn slow_factory(
    delay: Duration,
    progress: Arc<Progress>,
) -> impl ProcessorFactory<Processor = SlowProcessor> + 'static {
    move |_worker: usize| {
        let progress = Arc::clone(&progress);
        async move { Ok::<_, BoxError>(SlowProcessor { delay, progress }) }
    }
}

fn pipeline_factory(
    store: MemoryStore,
    broadcaster: MemoryBroadcaster,
    metrics: Arc<Metrics>,
) -> impl ProcessorFactory<Processor = LogPartProcessor<MemoryStore, MemoryBroadcaster>> + 'static
{
    move |worker: usize| {
        let processor = LogPartProcessor::new(
            worker,
            store.clone(),
            broadcaster.clone(),
            Arc::clone(&metrics),
        );
        async move { Ok::<_, BoxError>(processor) }
    }
}

fn log_part(job_id: i64, number: i64) -> String {
    format!(r#"{{"id":{job_id},"number":{number},"log":"line {number}\n","final":false}}"#)
}

// ============================================================================
// Prefetch and Acknowledgment
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_in_flight_never_exceeds_prefetch() {
    let broker = MemoryBroker::new(2);
    for i in 0..50 {
        broker.publish(format!("message {i}")).unwrap();
    }
    broker.end_stream();

    let progress = Arc::new(Progress::default());
    broker
        .subscribe(QUEUE, 3, slow_factory(Duration::from_millis(10), Arc::clone(&progress)))
        .await
        .unwrap();

    let stats = broker.stats();
    assert_eq!(stats.prefetch, 6);
    assert_eq!(stats.max_in_flight, 6);
    assert_eq!(stats.delivered, 50);
    assert_eq!(stats.acked, 50);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(progress.finished.load(Ordering::SeqCst), 50);
}

#[tokio::test(start_paused = true)]
async fn test_zero_multiplier_still_delivers_one_at_a_time() {
    let broker = MemoryBroker::new(0);
    for i in 0..5 {
        broker.publish(format!("message {i}")).unwrap();
    }
    broker.end_stream();

    let progress = Arc::new(Progress::default());
    broker
        .subscribe(QUEUE, 2, slow_factory(Duration::from_millis(10), Arc::clone(&progress)))
        .await
        .unwrap();

    let stats = broker.stats();
    assert_eq!(stats.prefetch, 1);
    assert_eq!(stats.max_in_flight, 1);
    assert_eq!(stats.acked, 5);
    assert_eq!(progress.finished.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_failed_messages_are_acknowledged() {
    let store = MemoryStore::new();
    let broadcaster = MemoryBroadcaster::new();
    let metrics = Arc::new(Metrics::new());
    store.register_log(1, 10);

    let broker = MemoryBroker::new(3);
    broker.publish(log_part(1, 0)).unwrap();
    broker.publish(log_part(999, 0)).unwrap();
    broker.publish("{broken").unwrap();
    broker.publish(log_part(1, 1)).unwrap();
    broker.end_stream();

    broker
        .subscribe(
            QUEUE,
            2,
            pipeline_factory(store.clone(), broadcaster.clone(), Arc::clone(&metrics)),
        )
        .await
        .unwrap();

    let stats = broker.stats();
    assert_eq!(stats.delivered, 4);
    assert_eq!(stats.acked, 4);
    assert_eq!(store.parts().len(), 2);
    assert_eq!(broadcaster.events().len(), 2);
    assert_eq!(metrics.processed(), 4);
    assert_eq!(metrics.processing_failures(), 2);
}

#[tokio::test]
async fn test_store_error_during_persist_is_acknowledged_and_counted() {
    let store = MemoryStore::new();
    let broadcaster = MemoryBroadcaster::new();
    let metrics = Arc::new(Metrics::new());
    store.register_log(42, 7);
    store.fail_inserts("connection reset by peer");

    let broker = MemoryBroker::new(3);
    broker.publish(log_part(42, 3)).unwrap();
    broker.end_stream();

    broker
        .subscribe(
            QUEUE,
            1,
            pipeline_factory(store.clone(), broadcaster.clone(), Arc::clone(&metrics)),
        )
        .await
        .unwrap();

    let stats = broker.stats();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(metrics.processing_failures(), 1);
    assert!(store.parts().is_empty());
    assert!(broadcaster.events().is_empty());
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_lets_workers_finish_current_message() {
    let broker = MemoryBroker::new(3);
    for i in 0..100 {
        broker.publish(format!("message {i}")).unwrap();
    }

    let progress = Arc::new(Progress::default());
    consume(
        &broker,
        QUEUE,
        2,
        slow_factory(Duration::from_millis(10), Arc::clone(&progress)),
        tokio::time::sleep(Duration::from_millis(25)),
    )
    .await
    .unwrap();

    let started = progress.started.load(Ordering::SeqCst);
    let finished = progress.finished.load(Ordering::SeqCst);
    assert!(finished > 0);
    assert!(finished < 100);
    assert_eq!(started, finished);

    let stats = broker.stats();
    assert_eq!(stats.acked, finished as u64);
    assert!(stats.delivered <= stats.acked + u64::from(stats.prefetch));
    assert_eq!(broker.state(), BrokerState::Closed);
}

#[tokio::test]
async fn test_stream_end_closes_broker() {
    let broker = MemoryBroker::new(3);
    broker.publish("only").unwrap();
    broker.end_stream();

    let progress = Arc::new(Progress::default());
    consume(
        &broker,
        QUEUE,
        4,
        slow_factory(Duration::ZERO, Arc::clone(&progress)),
        std::future::pending(),
    )
    .await
    .unwrap();

    assert_eq!(progress.finished.load(Ordering::SeqCst), 1);
    assert_eq!(broker.state(), BrokerState::Closed);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_supervise_drains_queue_and_stops_metrics() {
    let store = MemoryStore::new();
    let broadcaster = MemoryBroadcaster::new();
    let metrics = Arc::new(Metrics::new());
    store.register_log(5, 50);

    let broker = MemoryBroker::new(3);
    for number in 0..20 {
        broker.publish(log_part(5, number)).unwrap();
    }
    broker.end_stream();

    supervise(
        &broker,
        QUEUE,
        4,
        pipeline_factory(store.clone(), broadcaster.clone(), Arc::clone(&metrics)),
        Arc::clone(&metrics),
        spawn_flush_loop(Arc::clone(&metrics), Duration::from_secs(60)),
        std::future::pending(),
    )
    .await
    .unwrap();

    let mut numbers: Vec<i64> = store.parts().iter().map(|p| p.number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (0..20).collect::<Vec<_>>());
    assert_eq!(broadcaster.events().len(), 20);
    assert_eq!(metrics.processed(), 20);
    assert_eq!(metrics.processing_failures(), 0);
    assert!(metrics.flushes() >= 1);
}

// ============================================================================
// Subscription Failures
// ============================================================================

#[tokio::test]
async fn test_factory_failure_aborts_before_consuming() {
    let broker = MemoryBroker::new(3);
    broker.publish("pending").unwrap();

    let progress = Arc::new(Progress::default());
    let factory = move |worker: usize| {
        let progress = Arc::clone(&progress);
        async move {
            if worker == 1 {
                return Err::<SlowProcessor, BoxError>("database pool exhausted".into());
            }
            Ok(SlowProcessor {
                delay: Duration::ZERO,
                progress,
            })
        }
    };

    let err = broker.subscribe(QUEUE, 3, factory).await.unwrap_err();

    assert!(matches!(err, BrokerError::Factory { worker: 1, .. }));
    assert!(err.to_string().contains("database pool exhausted"));
    assert_eq!(broker.stats().delivered, 0);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_zero_workers_rejected() {
    let broker = MemoryBroker::new(3);
    let progress = Arc::new(Progress::default());

    let err = broker
        .subscribe(QUEUE, 0, slow_factory(Duration::ZERO, progress))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::NoWorkers));
}

#[tokio::test]
async fn test_subscribe_after_close_rejected() {
    let broker = MemoryBroker::new(3);
    broker.close().await.unwrap();

    let err = broker
        .subscribe(
            QUEUE,
            1,
            slow_factory(Duration::ZERO, Arc::new(Progress::default())),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BrokerError::InvalidState {
            from: BrokerState::Closed,
            to: BrokerState::Subscribed
        }
    ));
}
