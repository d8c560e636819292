//! RabbitMQ broker over AMQP 0-9-1

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    build_processors, run_workers, Acknowledger, BrokerState, Delivery, Lifecycle, MessageBroker,
    ProcessorFactory, CONSUMER_TAG,
};
use crate::config::{prefetch_for, BrokerConfig};
use crate::error::BrokerError;

const REPLY_SUCCESS: u16 = 200;

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery::new(delivery.data, AmqpAcker(delivery.acker))
    }
}

/// Broker backed by one AMQP connection
pub struct AmqpBroker {
    connection: Connection,
    consumer_channel: Mutex<Option<Channel>>,
    prefetch_multiplier: u16,
    lifecycle: Lifecycle,
    stop: CancellationToken,
    drained: CancellationToken,
}

impl AmqpBroker {
    /// Connect and declare the queue and exchange the producer publishes to
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let lifecycle = Lifecycle::new();

        info!("Connecting to AMQP");
        let connection = Connection::connect(&config.url, ConnectionProperties::default()).await?;

        let setup = connection.create_channel().await?;
        setup
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        setup
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        setup.close(REPLY_SUCCESS, "topology declared").await?;

        lifecycle.advance(BrokerState::Connected)?;
        info!(queue = %config.queue, exchange = %config.exchange, "AMQP topology declared");

        Ok(Self {
            connection,
            consumer_channel: Mutex::new(None),
            prefetch_multiplier: config.prefetch_multiplier,
            lifecycle,
            stop: CancellationToken::new(),
            drained: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> BrokerState {
        self.lifecycle.current()
    }

    fn consumer_channel(&self) -> Option<Channel> {
        self.consumer_channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn subscribe<F>(&self, queue: &str, workers: usize, factory: F) -> Result<(), BrokerError>
    where
        F: ProcessorFactory + 'static,
    {
        self.lifecycle.advance(BrokerState::Subscribed)?;
        let _drained = self.drained.clone().drop_guard();

        let processors = build_processors(&factory, workers).await?;

        let prefetch = prefetch_for(workers, self.prefetch_multiplier);
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        *self
            .consumer_channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());

        let consumer = channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue, workers, prefetch, "Subscribed");

        let stop = self.stop.clone();
        let deliveries = consumer
            .map(|item| item.map(Delivery::from).map_err(BrokerError::from))
            .take_until(async move { stop.cancelled().await })
            .boxed();

        run_workers(deliveries, processors).await;
        info!(queue, "Delivery stream closed, workers drained");

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(previous) = self.lifecycle.close() else {
            return Ok(());
        };

        self.stop.cancel();
        if previous == BrokerState::Subscribed {
            self.drained.cancelled().await;
        }

        if let Some(channel) = self.consumer_channel() {
            if let Err(e) = channel.close(REPLY_SUCCESS, "worker shutting down").await {
                debug!(error = %e, "Consumer channel already closed");
            }
        }

        if let Err(e) = self.connection.close(REPLY_SUCCESS, "worker shutting down").await {
            debug!(error = %e, "AMQP connection already closed");
        }

        info!("AMQP broker closed");
        Ok(())
    }
}
