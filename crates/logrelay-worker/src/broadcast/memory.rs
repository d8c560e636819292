//! Recording broadcaster

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::Broadcaster;
use crate::error::BroadcastError;

/// One captured publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub channel: String,
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
struct State {
    events: Vec<PublishedEvent>,
    failure: Option<String>,
}

/// Broadcaster double that keeps every event in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBroadcaster {
    state: Arc<Mutex<State>>,
}

impl MemoryBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject every subsequent publish
    pub fn fail_with(&self, reason: impl Into<String>) {
        self.state().failure = Some(reason.into());
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.state().events.clone()
    }
}

#[async_trait]
impl Broadcaster for MemoryBroadcaster {
    async fn publish(&self, channel: &str, event: &str, data: &str) -> Result<(), BroadcastError> {
        let mut state = self.state();
        if let Some(reason) = &state.failure {
            return Err(BroadcastError::Unavailable(reason.clone()));
        }
        state.events.push(PublishedEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            data: data.to_string(),
        });
        Ok(())
    }
}
