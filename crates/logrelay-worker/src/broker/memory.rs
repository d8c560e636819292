//! In-process broker
//!
//! Queues bodies in memory and hands them to the worker pool under the same
//! prefetch bound a real broker enforces: at most `workers * multiplier`
//! deliveries are unacknowledged at any time. Deliveries still buffered when
//! the broker closes are dropped unacknowledged, as a closed AMQP channel
//! would return them to the queue.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    build_processors, run_workers, Acknowledger, BrokerState, Delivery, Lifecycle, MessageBroker,
    ProcessorFactory,
};
use crate::config::prefetch_for;
use crate::error::BrokerError;

/// Point-in-time delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub acked: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub prefetch: u16,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    prefetch: AtomicU16,
}

impl Counters {
    fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn record_ack(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.acked.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            prefetch: self.prefetch.load(Ordering::SeqCst),
        }
    }
}

/// Releases one prefetch slot when acknowledged
struct MemoryAcker {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.counters.record_ack();
        Ok(())
    }
}

/// Move queued bodies to the workers' buffer while prefetch slots are free
async fn pump(
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    slots: Arc<Semaphore>,
    counters: Arc<Counters>,
    ready: mpsc::UnboundedSender<Delivery>,
) {
    loop {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let Some(body) = queue.recv().await else {
            break;
        };

        counters.record_delivery();
        let acker = MemoryAcker {
            counters: Arc::clone(&counters),
            _permit: permit,
        };
        if ready.send(Delivery::new(body, acker)).is_err() {
            break;
        }
    }
}

pub struct MemoryBroker {
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    prefetch_multiplier: u16,
    lifecycle: Lifecycle,
    counters: Arc<Counters>,
    stop: CancellationToken,
    drained: CancellationToken,
}

impl MemoryBroker {
    pub fn new(prefetch_multiplier: u16) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            prefetch_multiplier,
            lifecycle: Lifecycle::connected(),
            counters: Arc::new(Counters::default()),
            stop: CancellationToken::new(),
            drained: CancellationToken::new(),
        }
    }

    /// Enqueue a message body
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(body.into()).map_err(|_| BrokerError::Closed),
            None => Err(BrokerError::Closed),
        }
    }

    /// Stop accepting messages; the delivery stream ends once the queue is empty
    pub fn end_stream(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn stats(&self) -> DeliveryStats {
        self.counters.snapshot()
    }

    pub fn state(&self) -> BrokerState {
        self.lifecycle.current()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PREFETCH_MULTIPLIER)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn subscribe<F>(&self, queue: &str, workers: usize, factory: F) -> Result<(), BrokerError>
    where
        F: ProcessorFactory + 'static,
    {
        self.lifecycle.advance(BrokerState::Subscribed)?;
        let _drained = self.drained.clone().drop_guard();

        let processors = build_processors(&factory, workers).await?;

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BrokerError::Closed)?;

        let prefetch = prefetch_for(workers, self.prefetch_multiplier);
        self.counters.prefetch.store(prefetch, Ordering::SeqCst);
        let slots = Arc::new(Semaphore::new(usize::from(prefetch)));
        info!(queue, workers, prefetch, "Subscribed");

        let (ready, buffered) = mpsc::unbounded_channel();
        let pumping = tokio::spawn(pump(receiver, slots, Arc::clone(&self.counters), ready));

        let stop = self.stop.clone();
        let deliveries = stream::unfold(buffered, |mut buffered| async move {
            let delivery = buffered.recv().await?;
            Some((Ok(delivery), buffered))
        })
        .take_until(async move { stop.cancelled().await })
        .boxed();

        run_workers(deliveries, processors).await;
        pumping.abort();
        debug!(queue, "Delivery stream closed, workers drained");

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(previous) = self.lifecycle.close() else {
            return Ok(());
        };

        self.end_stream();
        self.stop.cancel();
        if previous == BrokerState::Subscribed {
            self.drained.cancelled().await;
        }

        debug!("Memory broker closed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_after_end_is_rejected() {
        let broker = MemoryBroker::new(3);
        broker.publish(b"{}".to_vec()).unwrap();
        broker.end_stream();
        assert!(matches!(broker.publish("late"), Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn test_close_before_subscribe() {
        let broker = MemoryBroker::default();
        assert_eq!(broker.state(), BrokerState::Connected);

        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert_eq!(broker.state(), BrokerState::Closed);
        assert_eq!(broker.stats(), DeliveryStats::default());
    }
}
