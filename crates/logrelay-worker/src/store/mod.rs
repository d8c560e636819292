//! Relational store boundary
//!
//! The pipeline needs two operations: resolve the parent log of a job and
//! insert one part row. [`postgres::PgLogStore`] talks to the database,
//! [`memory::MemoryStore`] is the in-process double used by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgLogStore;

/// Part row to insert; content is already free of NUL bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewLogPart<'a> {
    pub log_id: i64,
    pub number: i64,
    pub content: &'a str,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// Persisted part row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPartRecord {
    pub id: i64,
    pub log_id: i64,
    pub number: i64,
    pub content: String,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Internal id of the log that owns `job_id`
    ///
    /// Returns [`StoreError::NotFound`] when the job has no log row yet.
    async fn find_log_id(&self, job_id: i64) -> Result<i64, StoreError>;

    /// Insert a part row and return its id
    async fn create_log_part(&self, part: &NewLogPart<'_>) -> Result<i64, StoreError>;
}
