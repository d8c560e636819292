//! Log part pipeline
//!
//! Every delivery runs through four fail-fast stages:
//!
//! 1. **parse** the JSON payload and strip NUL bytes from the content
//! 2. **resolve** the parent log id of the job
//! 3. **persist** one part row
//! 4. **publish** the part to the job's realtime channel
//!
//! The first failing stage ends the pipeline; its error carries the stage
//! name. Nothing is retried, so a call performs at most one insert and at
//! most one publish.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, field, info_span, warn, Instrument, Span};

use crate::broadcast::{job_channel, Broadcaster, LogPartBroadcast, LOG_PART_EVENT};
use crate::broker::MessageProcessor;
use crate::error::{BroadcastError, ProcessError};
use crate::metrics::Metrics;
use crate::store::{LogStore, NewLogPart};

/// Decoded queue message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogPartPayload {
    #[serde(rename = "id")]
    pub job_id: i64,
    pub number: i64,
    #[serde(rename = "log")]
    pub content: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    /// Correlation id set by the producer; not stored or broadcast
    #[serde(default)]
    pub uuid: Option<String>,
}

impl LogPartPayload {
    /// Decode `body` and sanitize its content
    pub fn parse(body: &[u8]) -> Result<Self, ProcessError> {
        let mut payload: Self = serde_json::from_slice(body)?;
        if payload.content.contains('\0') {
            payload.content = sanitize(&payload.content);
        }
        Ok(payload)
    }
}

/// Remove NUL bytes, which the database rejects in text columns
pub fn sanitize(content: &str) -> String {
    content.replace('\0', "")
}

/// Outcome of a successfully processed part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedPart {
    pub part_id: i64,
    pub log_id: i64,
    pub job_id: i64,
    pub number: i64,
    pub is_final: bool,
}

/// Pipeline bound to one worker's own store and broadcaster
pub struct LogPartProcessor<S, B> {
    worker: usize,
    store: S,
    broadcaster: B,
    metrics: Arc<Metrics>,
}

impl<S, B> LogPartProcessor<S, B>
where
    S: LogStore,
    B: Broadcaster,
{
    pub fn new(worker: usize, store: S, broadcaster: B, metrics: Arc<Metrics>) -> Self {
        Self {
            worker,
            store,
            broadcaster,
            metrics,
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Run the pipeline for one message body, recording timing and failures
    ///
    /// Events are emitted inside a `log_part` span carrying the job id and
    /// part number once the payload has been parsed.
    pub async fn handle(&self, body: &[u8]) -> Result<ProcessedPart, ProcessError> {
        let span = info_span!("log_part", job_id = field::Empty, number = field::Empty);
        let result = self
            .metrics
            .time_processing(self.run(body).instrument(span.clone()))
            .await;

        span.in_scope(|| match &result {
            Ok(part) => debug!(part_id = part.part_id, log_id = part.log_id, "Log part stored"),
            Err(e) => {
                self.metrics.mark_processing_failed();
                warn!(
                    stage = %e.stage(),
                    worker = self.worker,
                    error = %e,
                    "Failed to process log part"
                );
            }
        });

        result
    }

    async fn run(&self, body: &[u8]) -> Result<ProcessedPart, ProcessError> {
        let payload = LogPartPayload::parse(body)?;
        Span::current()
            .record("job_id", payload.job_id)
            .record("number", payload.number);

        let log_id = self.resolve(&payload).await?;
        let part_id = self.persist(log_id, &payload).await?;
        self.publish(&payload).await?;

        Ok(ProcessedPart {
            part_id,
            log_id,
            job_id: payload.job_id,
            number: payload.number,
            is_final: payload.is_final,
        })
    }

    async fn resolve(&self, payload: &LogPartPayload) -> Result<i64, ProcessError> {
        self.store
            .find_log_id(payload.job_id)
            .await
            .map_err(ProcessError::from_lookup)
    }

    async fn persist(&self, log_id: i64, payload: &LogPartPayload) -> Result<i64, ProcessError> {
        let part = NewLogPart {
            log_id,
            number: payload.number,
            content: &payload.content,
            is_final: payload.is_final,
            created_at: Utc::now(),
        };

        self.store
            .create_log_part(&part)
            .await
            .map_err(ProcessError::Persist)
    }

    async fn publish(&self, payload: &LogPartPayload) -> Result<(), ProcessError> {
        let data = serde_json::to_string(&LogPartBroadcast {
            job_id: payload.job_id,
            number: payload.number,
            content: &payload.content,
            is_final: payload.is_final,
        })
        .map_err(|e| ProcessError::Publish(BroadcastError::Encode(e)))?;

        let channel = job_channel(payload.job_id);
        let published = self
            .metrics
            .time_publish(self.broadcaster.publish(&channel, LOG_PART_EVENT, &data))
            .await;

        if published.is_err() {
            self.metrics.mark_publish_failed();
        }
        published.map_err(ProcessError::Publish)
    }
}

#[async_trait]
impl<S, B> MessageProcessor for LogPartProcessor<S, B>
where
    S: LogStore + 'static,
    B: Broadcaster + 'static,
{
    async fn process(&mut self, body: &[u8]) -> Result<(), ProcessError> {
        self.handle(body).await.map(|_| ())
    }
}
