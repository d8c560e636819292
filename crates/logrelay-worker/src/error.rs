//! Worker error types
//!
//! Per-message failures ([`ProcessError`]) are recoverable: they are logged,
//! counted and the delivery is still acknowledged. Startup failures
//! ([`StartupError`]) terminate the process.

use std::fmt;
use thiserror::Error;

/// Boxed error returned by processor factories
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One step of the log part pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Parse,
    Resolve,
    Persist,
    Publish,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Resolve => "resolve",
            Stage::Persist => "persist",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relational store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no log with job_id:{job_id} found")]
    NotFound { job_id: i64 },

    #[error("db query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Realtime broadcast failures
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("error during json encoding: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("error publishing to pusher: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pusher rejected event with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("pusher {0} was empty")]
    MissingCredential(&'static str),

    #[error("pusher secret cannot key HMAC-SHA256")]
    InvalidSecret,

    #[error("broadcaster unavailable: {0}")]
    Unavailable(String),
}

/// Queue transport failures
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("broker cannot move from {from} to {to}")]
    InvalidState {
        from: crate::broker::BrokerState,
        to: crate::broker::BrokerState,
    },

    #[error("failed to build processor for worker {worker}: {source}")]
    Factory {
        worker: usize,
        #[source]
        source: BoxError,
    },

    #[error("subscription needs at least one worker")]
    NoWorkers,

    #[error("broker is closed")]
    Closed,
}

/// Failure of a single log part, tagged with the stage that produced it
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("parse: error during json decoding: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("resolve: no log with job_id:{job_id} found")]
    NotFound { job_id: i64 },

    #[error("resolve: {0}")]
    Resolve(#[source] StoreError),

    #[error("persist: {0}")]
    Persist(#[source] StoreError),

    #[error("publish: {0}")]
    Publish(#[source] BroadcastError),
}

/// Coarse classification of a [`ProcessError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    NotFound,
    Store,
    Broadcast,
}

impl ProcessError {
    /// Stage that failed
    pub fn stage(&self) -> Stage {
        match self {
            ProcessError::Parse(_) => Stage::Parse,
            ProcessError::NotFound { .. } | ProcessError::Resolve(_) => Stage::Resolve,
            ProcessError::Persist(_) => Stage::Persist,
            ProcessError::Publish(_) => Stage::Publish,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::Parse(_) => ErrorKind::Parse,
            ProcessError::NotFound { .. } => ErrorKind::NotFound,
            ProcessError::Resolve(_) | ProcessError::Persist(_) => ErrorKind::Store,
            ProcessError::Publish(_) => ErrorKind::Broadcast,
        }
    }

    /// Map a lookup failure, splitting out the missing-parent case
    pub(crate) fn from_lookup(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { job_id } => ProcessError::NotFound { job_id },
            other => ProcessError::Resolve(other),
        }
    }
}

/// Fatal errors raised while the supervisor brings the worker up
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] logrelay_common::RelayError),

    #[error("store unreachable: {0}")]
    Store(#[source] StoreError),

    #[error("broadcaster unavailable: {0}")]
    Broadcaster(#[source] BroadcastError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parent_is_not_found() {
        let err = ProcessError::from_lookup(StoreError::NotFound { job_id: 999 });
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.stage(), Stage::Resolve);
        assert_eq!(err.to_string(), "resolve: no log with job_id:999 found");
    }

    #[test]
    fn test_lookup_transport_failure_is_store_error() {
        let err = ProcessError::from_lookup(StoreError::Unavailable("connection reset".into()));
        assert_eq!(err.kind(), ErrorKind::Store);
        assert_eq!(err.stage(), Stage::Resolve);
    }

    #[test]
    fn test_message_carries_stage_name() {
        let err = ProcessError::Persist(StoreError::Unavailable("disk full".into()));
        assert!(err.to_string().starts_with("persist: "));
        assert_eq!(
            ProcessError::Publish(BroadcastError::Rejected {
                status: 401,
                body: "bad signature".into()
            })
            .stage()
            .to_string(),
            "publish"
        );
    }
}
