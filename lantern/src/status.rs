//! Job status store.
//!
//! Holds one [`JobRecord`] per issued task id. Writers only ever move a
//! record forward (see [`JobState::can_transition_to`]); a rejected write
//! reports the state that blocked it instead of failing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::job::{JobFailure, JobRecord, JobState, TaskId};

/// Result of a state transition attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransitionOutcome {
    /// The record moved; `previous` is the state it left.
    Applied { previous: JobState },
    /// The record was already in `current`, which does not allow the move.
    Rejected { current: JobState },
    /// No record exists for the task id.
    Missing,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Record a freshly issued task.
    async fn insert_pending(&self, record: JobRecord) -> anyhow::Result<()>;

    /// Mark the job as running its `attempt`-th delivery.
    async fn mark_started(&self, task_id: TaskId, attempt: u32) -> anyhow::Result<TransitionOutcome>;

    async fn mark_succeeded(&self, task_id: TaskId, result: Value) -> anyhow::Result<TransitionOutcome>;

    async fn mark_failed(&self, task_id: TaskId, failure: JobFailure) -> anyhow::Result<TransitionOutcome>;

    /// Pure read.
    async fn get(&self, task_id: TaskId) -> anyhow::Result<Option<JobRecord>>;

    /// Drop terminal records that finished before `finished_before`.
    async fn purge_expired(&self, finished_before: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[derive(Clone, Default)]
pub struct InMemoryStatusStore {
    records: Arc<RwLock<HashMap<TaskId, JobRecord>>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        task_id: TaskId,
        next: JobState,
        apply: impl FnOnce(&mut JobRecord),
    ) -> TransitionOutcome {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(&task_id) else {
            return TransitionOutcome::Missing;
        };
        if !record.state.can_transition_to(next) {
            return TransitionOutcome::Rejected {
                current: record.state,
            };
        }
        let previous = record.state;
        record.state = next;
        apply(record);
        TransitionOutcome::Applied { previous }
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn insert_pending(&self, record: JobRecord) -> anyhow::Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.task_id) {
            anyhow::bail!("task {} already recorded", record.task_id);
        }
        records.insert(record.task_id, record);
        Ok(())
    }

    async fn mark_started(&self, task_id: TaskId, attempt: u32) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(task_id, JobState::Started, |record| {
            record.attempts = record.attempts.max(attempt);
            record.started_at.get_or_insert_with(Utc::now);
        }))
    }

    async fn mark_succeeded(&self, task_id: TaskId, result: Value) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(task_id, JobState::Success, |record| {
            record.result = Some(result);
            record.finished_at = Some(Utc::now());
        }))
    }

    async fn mark_failed(&self, task_id: TaskId, failure: JobFailure) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(task_id, JobState::Failure, |record| {
            record.error = Some(failure);
            record.finished_at = Some(Utc::now());
        }))
    }

    async fn get(&self, task_id: TaskId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.records.read().get(&task_id).cloned())
    }

    async fn purge_expired(&self, finished_before: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| match record.finished_at {
            Some(finished) => finished >= finished_before,
            None => true,
        });
        Ok((before - records.len()) as u64)
    }
}
