//! Realtime broadcast boundary
//!
//! Every stored part is republished to the job's channel so browsers tailing
//! a running job see new output without polling.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BroadcastError;

pub mod memory;
pub mod pusher;

pub use memory::{MemoryBroadcaster, PublishedEvent};
pub use pusher::PusherClient;

/// Event name used for log part updates
pub const LOG_PART_EVENT: &str = "job:log";

/// Channel a job's updates are published on
pub fn job_channel(job_id: i64) -> String {
    format!("job-{}", job_id)
}

/// Body published for each part; `content` goes out as `_log`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPartBroadcast<'a> {
    #[serde(rename = "id")]
    pub job_id: i64,
    pub number: i64,
    #[serde(rename = "_log")]
    pub content: &'a str,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Publish an already encoded `data` payload as `event` on `channel`
    async fn publish(&self, channel: &str, event: &str, data: &str) -> Result<(), BroadcastError>;
}
