//! Logrelay Worker Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Queue-driven ingestion of job log parts.
//!
//! # Overview
//!
//! Producers publish one JSON message per fragment of a running job's output.
//! The worker consumes them with a fixed pool of competing workers and, for
//! each message:
//!
//! - **parses** the payload and strips NUL bytes from the content
//! - **resolves** the parent log row of the job
//! - **persists** a `log_parts` row
//! - **publishes** the part on the job's Pusher channel for live viewing
//!
//! Every delivery is acknowledged once processed, whether it succeeded or
//! not. Failures are logged with the stage that produced them and counted in
//! [`metrics::Metrics`]; they are never retried or requeued.
//!
//! # Architecture
//!
//! Each external system sits behind a trait with one live implementation and
//! one in-memory double:
//!
//! | boundary | trait | live | double |
//! |---|---|---|---|
//! | queue | [`broker::MessageBroker`] | [`broker::AmqpBroker`] | [`broker::MemoryBroker`] |
//! | database | [`store::LogStore`] | [`store::PgLogStore`] | [`store::MemoryStore`] |
//! | realtime | [`broadcast::Broadcaster`] | [`broadcast::PusherClient`] | [`broadcast::MemoryBroadcaster`] |
//!
//! Workers never share store or broadcaster handles; each one gets its own
//! from a [`broker::ProcessorFactory`]. The metrics registry is the only
//! state all workers touch.
//!
//! # Example
//!
//! ```no_run
//! use logrelay_worker::{config::Config, supervisor::Supervisor};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! Supervisor::new(config).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mode;
pub mod processor;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use error::{ProcessError, StartupError};
pub use mode::ProcessMode;
pub use processor::LogPartProcessor;
pub use supervisor::Supervisor;
