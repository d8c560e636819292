//! Startup ordering and worker pool lifecycle
//!
//! Startup is fail-fast, in this order:
//!
//! 1. the database answers a ping
//! 2. Pusher credentials are present and a client can be built
//! 3. the metrics flush loop is running
//! 4. the broker is connected and the pool is subscribed
//!
//! After that the supervisor blocks until the delivery stream closes or a
//! termination signal arrives.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broadcast::PusherClient;
use crate::broker::{consume, AmqpBroker, MessageBroker, ProcessorFactory};
use crate::config::{Config, DatabaseConfig, PusherConfig};
use crate::error::{BoxError, BrokerError, StartupError};
use crate::metrics::{log_metrics, spawn_flush_loop, Metrics};
use crate::processor::LogPartProcessor;
use crate::store::PgLogStore;

/// Builds each worker's private database pool and Pusher client
#[derive(Debug, Clone)]
pub struct WorkerFactory {
    database: DatabaseConfig,
    pusher: PusherConfig,
    metrics: Arc<Metrics>,
}

impl WorkerFactory {
    pub fn new(database: DatabaseConfig, pusher: PusherConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            database,
            pusher,
            metrics,
        }
    }
}

#[async_trait]
impl ProcessorFactory for WorkerFactory {
    type Processor = LogPartProcessor<PgLogStore, PusherClient>;

    async fn create(&self, worker: usize) -> Result<Self::Processor, BoxError> {
        let store = PgLogStore::connect(&self.database).await?;
        let broadcaster = PusherClient::new(&self.pusher)?;
        debug!(worker, "Worker handles ready");

        Ok(LogPartProcessor::new(
            worker,
            store,
            broadcaster,
            Arc::clone(&self.metrics),
        ))
    }
}

/// External systems the supervisor checks and opens during startup
#[async_trait]
pub trait Dependencies: Send + Sync {
    type Broker: MessageBroker;
    type Factory: ProcessorFactory + 'static;

    async fn verify_store(&self) -> Result<(), StartupError>;

    fn verify_broadcaster(&self) -> Result<(), StartupError>;

    async fn connect_broker(&self) -> Result<Self::Broker, StartupError>;

    fn factory(&self, metrics: Arc<Metrics>) -> Self::Factory;
}

/// Postgres, Pusher and AMQP as configured
pub struct LiveDependencies<'a> {
    config: &'a Config,
}

impl<'a> LiveDependencies<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dependencies for LiveDependencies<'_> {
    type Broker = AmqpBroker;
    type Factory = WorkerFactory;

    /// Open the database, ping it and close it again
    async fn verify_store(&self) -> Result<(), StartupError> {
        let store = PgLogStore::connect(&self.config.database)
            .await
            .map_err(StartupError::Store)?;
        let checked = store.health_check().await;
        store.close().await;
        checked.map_err(StartupError::Store)?;

        info!("Database reachable");
        Ok(())
    }

    fn verify_broadcaster(&self) -> Result<(), StartupError> {
        PusherClient::new(&self.config.pusher).map_err(StartupError::Broadcaster)?;
        info!(app_id = %self.config.pusher.app_id, "Pusher client ready");
        Ok(())
    }

    async fn connect_broker(&self) -> Result<AmqpBroker, StartupError> {
        Ok(AmqpBroker::connect(&self.config.broker).await?)
    }

    fn factory(&self, metrics: Arc<Metrics>) -> WorkerFactory {
        WorkerFactory::new(
            self.config.database.clone(),
            self.config.pusher.clone(),
            metrics,
        )
    }
}

pub struct Supervisor {
    config: Config,
    metrics: Arc<Metrics>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Run the streaming pipeline until the queue closes or the process is signalled
    pub async fn run(self) -> Result<(), StartupError> {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until<S>(self, shutdown: S) -> Result<(), StartupError>
    where
        S: Future<Output = ()>,
    {
        start(
            &LiveDependencies::new(&self.config),
            &self.config.broker.queue,
            self.config.worker.workers,
            self.metrics,
            Duration::from_secs(self.config.worker.metrics_interval_secs),
            shutdown,
        )
        .await
    }
}

/// Bring the worker up in order, then consume until the stream ends or `shutdown` resolves
///
/// The flush loop is running before the broker is dialled and is stopped
/// again if the connection fails.
pub async fn start<D, S>(
    deps: &D,
    queue: &str,
    workers: usize,
    metrics: Arc<Metrics>,
    flush_interval: Duration,
    shutdown: S,
) -> Result<(), StartupError>
where
    D: Dependencies,
    S: Future<Output = ()>,
{
    deps.verify_store().await?;
    deps.verify_broadcaster()?;

    let flush = spawn_flush_loop(Arc::clone(&metrics), flush_interval);
    debug!(interval_secs = flush_interval.as_secs(), "Metrics flush loop started");

    let broker = match deps.connect_broker().await {
        Ok(broker) => broker,
        Err(e) => {
            flush.abort();
            return Err(e);
        }
    };

    let factory = deps.factory(Arc::clone(&metrics));
    supervise(&broker, queue, workers, factory, metrics, flush, shutdown).await?;

    Ok(())
}

/// Consume `queue` while `flush` logs metrics alongside
///
/// The loop is aborted once consumption ends and a last snapshot is logged.
pub async fn supervise<B, F, S>(
    broker: &B,
    queue: &str,
    workers: usize,
    factory: F,
    metrics: Arc<Metrics>,
    flush: JoinHandle<()>,
    shutdown: S,
) -> Result<(), BrokerError>
where
    B: MessageBroker,
    F: ProcessorFactory + 'static,
    S: Future<Output = ()>,
{
    info!(queue, workers, "Consuming log parts");

    let result = consume(broker, queue, workers, factory, shutdown).await;

    flush.abort();
    log_metrics(&metrics);
    info!(
        processed = metrics.processed(),
        failed = metrics.processing_failures(),
        "Worker pool stopped"
    );

    result
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining workers");
        },
        _ = terminate => {
            info!("Received terminate signal, draining workers");
        },
    }
}
