use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::job::JobEnvelope;
use crate::lease::{JobLease, LeaseId};

/// Trait for broker backends that move jobs from producers to workers.
///
/// Delivery is at-least-once: a lease that expires without being settled is
/// handed out again by [`JobBroker::reclaim_expired`].
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Make a job available to workers.
    async fn enqueue(&self, envelope: JobEnvelope) -> anyhow::Result<()>;

    /// Lease the next available job, if any.
    async fn dequeue(&self, worker_id: &str, lease_ttl: Duration) -> anyhow::Result<Option<JobLease>>;

    /// Push a held lease's expiry to `extend_by` from now and return the new
    /// expiry. Fails once the lease was settled or reclaimed.
    async fn renew(&self, lease_id: LeaseId, extend_by: Duration) -> anyhow::Result<DateTime<Utc>>;

    /// Settle a lease after the job succeeded.
    async fn complete(&self, lease_id: LeaseId) -> anyhow::Result<()>;

    /// Return a leased job to the queue, available again after `delay`.
    async fn retry(&self, lease_id: LeaseId, delay: Duration) -> anyhow::Result<()>;

    /// Settle a lease after the job failed for good.
    async fn fail(&self, lease_id: LeaseId) -> anyhow::Result<()>;

    /// Requeue jobs whose lease expired. Returns how many were requeued.
    async fn reclaim_expired(&self) -> anyhow::Result<u64>;

    /// Jobs waiting to be leased.
    async fn depth(&self) -> anyhow::Result<usize>;

    /// Connectivity check for health probes.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Process-local broker.
///
/// Suitable for `lantern all` and for tests; separate processes do not share it.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    waiting: Vec<Waiting>,
    leased: HashMap<LeaseId, Leased>,
    next_seq: u64,
}

struct Waiting {
    envelope: JobEnvelope,
    deliveries: u32,
    available_at: DateTime<Utc>,
    seq: u64,
}

struct Leased {
    envelope: JobEnvelope,
    deliveries: u32,
    expires_at: DateTime<Utc>,
}

impl BrokerState {
    fn push(&mut self, envelope: JobEnvelope, deliveries: u32, available_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.push(Waiting {
            envelope,
            deliveries,
            available_at,
            seq,
        });
    }

    fn take_lease(&mut self, lease_id: LeaseId) -> anyhow::Result<Leased> {
        match self.leased.remove(&lease_id) {
            Some(leased) => Ok(leased),
            None => bail!("lease {lease_id} is not held"),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently leased to a worker.
    pub fn leased_count(&self) -> usize {
        self.state.lock().leased.len()
    }
}

#[async_trait]
impl JobBroker for InMemoryBroker {
    async fn enqueue(&self, envelope: JobEnvelope) -> anyhow::Result<()> {
        self.state.lock().push(envelope, 0, Utc::now());
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str, lease_ttl: Duration) -> anyhow::Result<Option<JobLease>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let next = state
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| w.available_at <= now)
            .min_by_key(|(_, w)| (w.available_at, w.seq))
            .map(|(idx, _)| idx);
        let Some(idx) = next else {
            return Ok(None);
        };

        let waiting = state.waiting.swap_remove(idx);
        let attempt = waiting.deliveries + 1;
        let lease = JobLease::new(waiting.envelope.clone(), worker_id.to_string(), lease_ttl, attempt);
        state.leased.insert(
            lease.lease_id,
            Leased {
                envelope: waiting.envelope,
                deliveries: attempt,
                expires_at: lease.expires_at,
            },
        );
        Ok(Some(lease))
    }

    async fn renew(&self, lease_id: LeaseId, extend_by: Duration) -> anyhow::Result<DateTime<Utc>> {
        let mut state = self.state.lock();
        let Some(leased) = state.leased.get_mut(&lease_id) else {
            bail!("lease {lease_id} is not held");
        };
        leased.expires_at = Utc::now() + extend_by;
        Ok(leased.expires_at)
    }

    async fn complete(&self, lease_id: LeaseId) -> anyhow::Result<()> {
        self.state.lock().take_lease(lease_id).map(|_| ())
    }

    async fn retry(&self, lease_id: LeaseId, delay: Duration) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let leased = state.take_lease(lease_id)?;
        state.push(leased.envelope, leased.deliveries, Utc::now() + delay);
        Ok(())
    }

    async fn fail(&self, lease_id: LeaseId) -> anyhow::Result<()> {
        self.state.lock().take_lease(lease_id).map(|_| ())
    }

    async fn reclaim_expired(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let expired: Vec<LeaseId> = state
            .leased
            .iter()
            .filter(|(_, l)| l.expires_at < now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in &expired {
            if let Some(leased) = state.leased.remove(lease_id) {
                state.push(leased.envelope, leased.deliveries, now);
            }
        }
        Ok(expired.len() as u64)
    }

    async fn depth(&self) -> anyhow::Result<usize> {
        Ok(self.state.lock().waiting.len())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskId;
    use serde_json::json;

    fn envelope() -> JobEnvelope {
        JobEnvelope::new(TaskId::new(), "export", json!({}))
    }

    #[tokio::test]
    async fn test_fifo_dequeue_and_complete() {
        let broker = InMemoryBroker::new();
        let first = envelope();
        let second = envelope();
        broker.enqueue(first.clone()).await.unwrap();
        broker.enqueue(second.clone()).await.unwrap();

        let lease = broker.dequeue("w0", Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(lease.envelope.task_id, first.task_id);
        assert_eq!(lease.attempt, 1);
        assert_eq!(broker.depth().await.unwrap(), 1);
        assert_eq!(broker.leased_count(), 1);

        broker.complete(lease.lease_id).await.unwrap();
        assert_eq!(broker.leased_count(), 0);
        assert!(broker.complete(lease.lease_id).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_delays_and_counts_deliveries() {
        let broker = InMemoryBroker::new();
        broker.enqueue(envelope()).await.unwrap();

        let lease = broker.dequeue("w0", Duration::seconds(30)).await.unwrap().unwrap();
        broker.retry(lease.lease_id, Duration::milliseconds(50)).await.unwrap();
        assert!(broker.dequeue("w0", Duration::seconds(30)).await.unwrap().is_none());

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let again = broker.dequeue("w0", Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(again.envelope.task_id, lease.envelope.task_id);
    }

    #[tokio::test]
    async fn test_reclaim_expired_requeues() {
        let broker = InMemoryBroker::new();
        broker.enqueue(envelope()).await.unwrap();
        let lease = broker.dequeue("w0", Duration::milliseconds(-1)).await.unwrap().unwrap();

        assert_eq!(broker.reclaim_expired().await.unwrap(), 1);
        assert!(broker.fail(lease.lease_id).await.is_err());

        let again = broker.dequeue("w1", Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(again.worker_id, "w1");
    }

    #[tokio::test]
    async fn test_renewed_lease_is_not_reclaimed() {
        let broker = InMemoryBroker::new();
        broker.enqueue(envelope()).await.unwrap();
        let lease = broker.dequeue("w0", Duration::milliseconds(-1)).await.unwrap().unwrap();

        let expires_at = broker.renew(lease.lease_id, Duration::seconds(30)).await.unwrap();
        assert!(expires_at > Utc::now());
        assert_eq!(broker.reclaim_expired().await.unwrap(), 0);
        assert_eq!(broker.leased_count(), 1);

        broker.complete(lease.lease_id).await.unwrap();
        assert!(broker.renew(lease.lease_id, Duration::seconds(30)).await.is_err());
    }
}
