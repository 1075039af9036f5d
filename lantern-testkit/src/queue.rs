use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lantern::job::JobEnvelope;
use lantern::lease::{JobLease, LeaseId};
use lantern::queue::{InMemoryBroker, JobBroker};

/// Broker that fails its first `n` calls, then delegates to an in-memory broker.
#[derive(Clone)]
pub struct FlakyBroker {
    inner: InMemoryBroker,
    remaining_failures: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl FlakyBroker {
    pub fn failing_first(n: usize) -> Self {
        Self {
            inner: InMemoryBroker::new(),
            remaining_failures: Arc::new(AtomicUsize::new(n)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never answers successfully.
    pub fn unreachable() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn inner(&self) -> &InMemoryBroker {
        &self.inner
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self, op: &str) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("connection refused: broker {op} failed");
        }
        Ok(())
    }
}

#[async_trait]
impl JobBroker for FlakyBroker {
    async fn enqueue(&self, envelope: JobEnvelope) -> anyhow::Result<()> {
        self.trip("enqueue")?;
        self.inner.enqueue(envelope).await
    }

    async fn dequeue(&self, worker_id: &str, lease_ttl: Duration) -> anyhow::Result<Option<JobLease>> {
        self.trip("dequeue")?;
        self.inner.dequeue(worker_id, lease_ttl).await
    }

    async fn renew(&self, lease_id: LeaseId, extend_by: Duration) -> anyhow::Result<DateTime<Utc>> {
        self.inner.renew(lease_id, extend_by).await
    }

    async fn complete(&self, lease_id: LeaseId) -> anyhow::Result<()> {
        self.inner.complete(lease_id).await
    }

    async fn retry(&self, lease_id: LeaseId, delay: Duration) -> anyhow::Result<()> {
        self.inner.retry(lease_id, delay).await
    }

    async fn fail(&self, lease_id: LeaseId) -> anyhow::Result<()> {
        self.inner.fail(lease_id).await
    }

    async fn reclaim_expired(&self) -> anyhow::Result<u64> {
        self.inner.reclaim_expired().await
    }

    async fn depth(&self) -> anyhow::Result<usize> {
        self.inner.depth().await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.trip("ping")?;
        self.inner.ping().await
    }
}
