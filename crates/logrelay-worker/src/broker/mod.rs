//! Message broker boundary and worker pool
//!
//! A broker owns the queue connection. [`MessageBroker::subscribe`] opens one
//! consumption channel with a bounded prefetch and fans its deliveries out to
//! a fixed pool of workers (competing consumers). Each worker owns the
//! processor its factory built and acknowledges every delivery after
//! processing it, whether processing succeeded or not.
//!
//! Lifecycle: `Disconnected -> Connected -> Subscribed -> Closed`. There are
//! no backward transitions and `Closed` is terminal.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, error, warn, Instrument};

use crate::error::{BoxError, BrokerError, ProcessError};

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::{DeliveryStats, MemoryBroker};

/// Consumer tag announced to the broker
pub const CONSUMER_TAG: &str = "processor";

// ============================================================================
// Processors
// ============================================================================

/// Stateful handler bound to one worker
#[async_trait]
pub trait MessageProcessor: Send + 'static {
    async fn process(&mut self, body: &[u8]) -> Result<(), ProcessError>;
}

/// Builds one processor per worker index
#[async_trait]
pub trait ProcessorFactory: Send + Sync {
    type Processor: MessageProcessor;

    async fn create(&self, worker: usize) -> Result<Self::Processor, BoxError>;
}

#[async_trait]
impl<F, Fut, P> ProcessorFactory for F
where
    F: Fn(usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<P, BoxError>> + Send,
    P: MessageProcessor,
{
    type Processor = P;

    async fn create(&self, worker: usize) -> Result<P, BoxError> {
        (self)(worker).await
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Acknowledgment handle of one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
}

/// One received message; acknowledging consumes it
pub struct Delivery {
    body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, acker: impl Acknowledger + 'static) -> Self {
        Self {
            body,
            acker: Box::new(acker),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .finish_non_exhaustive()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

// ============================================================================
// Broker
// ============================================================================

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Consume `queue` with `workers` concurrent processors
    ///
    /// Returns once the delivery stream has ended and every worker has
    /// finished its current message.
    async fn subscribe<F>(&self, queue: &str, workers: usize, factory: F) -> Result<(), BrokerError>
    where
        F: ProcessorFactory + 'static;

    /// Stop consuming, wait for workers to drain, then release the connection
    ///
    /// Safe to call more than once and before any subscription.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Run a subscription until its stream ends or `shutdown` resolves
///
/// On shutdown the broker is closed while the subscription keeps being
/// driven, so in-flight messages are finished and acknowledged.
pub async fn consume<B, F, S>(
    broker: &B,
    queue: &str,
    workers: usize,
    factory: F,
    shutdown: S,
) -> Result<(), BrokerError>
where
    B: MessageBroker,
    F: ProcessorFactory + 'static,
    S: Future<Output = ()>,
{
    let subscription = broker.subscribe(queue, workers, factory);
    tokio::pin!(subscription);

    tokio::select! {
        result = &mut subscription => {
            broker.close().await?;
            result
        }
        () = shutdown => {
            tracing::info!("Shutdown requested, draining workers");
            let (closed, result) = tokio::join!(broker.close(), subscription);
            closed?;
            result
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connected,
    Subscribed,
    Closed,
}

impl BrokerState {
    pub fn can_become(self, next: BrokerState) -> bool {
        use BrokerState::*;
        matches!(
            (self, next),
            (Disconnected, Connected)
                | (Connected, Subscribed)
                | (Disconnected | Connected | Subscribed, Closed)
        )
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BrokerState::Disconnected => "disconnected",
            BrokerState::Connected => "connected",
            BrokerState::Subscribed => "subscribed",
            BrokerState::Closed => "closed",
        })
    }
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<BrokerState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::Disconnected),
        }
    }

    /// Lifecycle of a broker that needs no connection step
    pub(crate) fn connected() -> Self {
        Self {
            state: Mutex::new(BrokerState::Connected),
        }
    }

    pub(crate) fn current(&self) -> BrokerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn advance(&self, next: BrokerState) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_become(next) {
            return Err(BrokerError::InvalidState { from: *state, to: next });
        }
        *state = next;
        Ok(())
    }

    /// Move to `Closed`, returning the previous state, or `None` if already closed
    pub(crate) fn close(&self) -> Option<BrokerState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            BrokerState::Closed => None,
            previous => {
                *state = BrokerState::Closed;
                Some(previous)
            }
        }
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Call the factory once per worker before any message is consumed
pub(crate) async fn build_processors<F>(factory: &F, workers: usize) -> Result<Vec<F::Processor>, BrokerError>
where
    F: ProcessorFactory,
{
    if workers == 0 {
        return Err(BrokerError::NoWorkers);
    }

    let mut processors = Vec::with_capacity(workers);
    for worker in 0..workers {
        let processor = factory
            .create(worker)
            .await
            .map_err(|source| BrokerError::Factory { worker, source })?;
        processors.push(processor);
    }
    Ok(processors)
}

/// Drive `processors` against one shared delivery stream until it ends
pub(crate) async fn run_workers<P>(deliveries: DeliveryStream, processors: Vec<P>)
where
    P: MessageProcessor,
{
    let deliveries = Arc::new(tokio::sync::Mutex::new(deliveries));
    let mut pool = JoinSet::new();

    for (worker, processor) in processors.into_iter().enumerate() {
        let span = tracing::info_span!("worker", worker);
        pool.spawn(work(worker, processor, Arc::clone(&deliveries)).instrument(span));
    }

    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task terminated abnormally");
        }
    }
}

async fn work<P>(worker: usize, mut processor: P, deliveries: Arc<tokio::sync::Mutex<DeliveryStream>>)
where
    P: MessageProcessor,
{
    loop {
        let next = deliveries.lock().await.next().await;
        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                warn!(error = %e, "Delivery stream failed");
                break;
            }
            None => break,
        };

        if let Err(e) = processor.process(delivery.body()).await {
            debug!(error = %e, "Acknowledging failed message");
        }

        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to acknowledge delivery");
        }
    }

    debug!(worker, "Worker drained");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_moves_forward_only() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.advance(BrokerState::Subscribed).is_err());

        lifecycle.advance(BrokerState::Connected).unwrap();
        lifecycle.advance(BrokerState::Subscribed).unwrap();
        assert!(matches!(
            lifecycle.advance(BrokerState::Connected),
            Err(BrokerError::InvalidState {
                from: BrokerState::Subscribed,
                to: BrokerState::Connected
            })
        ));
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.close(), Some(BrokerState::Disconnected));
        assert_eq!(lifecycle.close(), None);
        assert!(lifecycle.advance(BrokerState::Connected).is_err());
        assert_eq!(lifecycle.current(), BrokerState::Closed);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = BrokerError::InvalidState {
            from: BrokerState::Closed,
            to: BrokerState::Subscribed,
        };
        assert_eq!(err.to_string(), "broker cannot move from closed to subscribed");
    }
}
