//! In-memory log store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{LogPartRecord, LogStore, NewLogPart};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    logs: HashMap<i64, i64>,
    parts: Vec<LogPartRecord>,
    lookups: usize,
    fail_lookups: Option<String>,
    fail_inserts: Option<String>,
}

/// Shared-state store double; clones observe the same rows
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the parent log of a job
    pub fn register_log(&self, job_id: i64, log_id: i64) {
        self.state().logs.insert(job_id, log_id);
    }

    /// Make every subsequent lookup fail as if the database were unreachable
    pub fn fail_lookups(&self, reason: impl Into<String>) {
        self.state().fail_lookups = Some(reason.into());
    }

    /// Make every subsequent insert fail
    pub fn fail_inserts(&self, reason: impl Into<String>) {
        self.state().fail_inserts = Some(reason.into());
    }

    pub fn parts(&self) -> Vec<LogPartRecord> {
        self.state().parts.clone()
    }

    pub fn lookups(&self) -> usize {
        self.state().lookups
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn find_log_id(&self, job_id: i64) -> Result<i64, StoreError> {
        let mut state = self.state();
        state.lookups += 1;
        if let Some(reason) = &state.fail_lookups {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        state
            .logs
            .get(&job_id)
            .copied()
            .ok_or(StoreError::NotFound { job_id })
    }

    async fn create_log_part(&self, part: &NewLogPart<'_>) -> Result<i64, StoreError> {
        let mut state = self.state();
        if let Some(reason) = &state.fail_inserts {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        let id = i64::try_from(state.parts.len()).unwrap_or(i64::MAX).saturating_add(1);
        state.parts.push(LogPartRecord {
            id,
            log_id: part.log_id,
            number: part.number,
            content: part.content.to_string(),
            is_final: part.is_final,
            created_at: part.created_at,
        });
        Ok(id)
    }
}
