//! Per-lease job execution.
//!
//! State machine: PENDING -> STARTED on the first delivery, then SUCCESS or
//! FAILURE. Transient failures go back to the broker with backoff while the
//! record stays STARTED; everything else settles immediately.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};

use crate::correlation::{self, RequestContext};
use crate::error::JobError;
use crate::job::{JobFailure, JobState};
use crate::lease::{JobLease, RetryPolicy};
use crate::logging::mask_url_credentials;
use crate::metrics::JobLifecycleEvent;
use crate::propagation::SpanOutcome;
use crate::queue::JobBroker;
use crate::status::{StatusStore, TransitionOutcome};
use crate::telemetry::Telemetry;

use super::handler::{HandlerRegistry, JobContext};

/// What happened to one delivery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// Sent back to the broker; the record stays STARTED.
    Retrying { delay_ms: i64 },
    Failed { kind: String },
    /// Duplicate or orphaned delivery that was settled without running.
    Skipped,
}

impl ExecutionOutcome {
    fn span_outcome(&self) -> SpanOutcome {
        match self {
            ExecutionOutcome::Succeeded | ExecutionOutcome::Skipped => SpanOutcome::Ok,
            ExecutionOutcome::Retrying { .. } => SpanOutcome::Error("retrying".into()),
            ExecutionOutcome::Failed { kind } => SpanOutcome::Error(kind.clone()),
        }
    }
}

#[derive(Clone)]
pub struct JobExecutor {
    broker: Arc<dyn JobBroker>,
    status: Arc<dyn StatusStore>,
    handlers: Arc<HandlerRegistry>,
    telemetry: Telemetry,
    retry: RetryPolicy,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("handlers", &self.handlers)
            .field("retry", &self.retry)
            .finish()
    }
}

impl JobExecutor {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        status: Arc<dyn StatusStore>,
        handlers: Arc<HandlerRegistry>,
        telemetry: Telemetry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            status,
            handlers,
            telemetry,
            retry,
        }
    }

    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Run one delivery inside a context rebuilt from its envelope.
    pub async fn execute(&self, lease: JobLease) -> ExecutionOutcome {
        let (ctx, span) = self.telemetry.begin_job(&lease.envelope, lease.attempt);
        let outcome = correlation::scope(Arc::clone(&ctx), self.run(&lease, &ctx)).await;
        if let Some(span) = span {
            span.end(outcome.span_outcome());
        }
        outcome
    }

    async fn run(&self, lease: &JobLease, ctx: &Arc<RequestContext>) -> ExecutionOutcome {
        let envelope = &lease.envelope;
        let task_id = envelope.task_id;
        let job_type = envelope.job_type.as_str();

        match self.status.mark_started(task_id, lease.attempt).await {
            Ok(TransitionOutcome::Applied { previous: JobState::Pending }) => {
                self.telemetry
                    .record_job_event(job_type, JobLifecycleEvent::Started);
                tracing::info!("Task {job_type} started");
            }
            Ok(TransitionOutcome::Applied { .. }) => {
                tracing::info!(attempt = lease.attempt, "Task {job_type} retry started");
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                tracing::warn!(state = %current, "Task already settled; dropping duplicate delivery");
                self.settle_lease(lease, true).await;
                return ExecutionOutcome::Skipped;
            }
            Ok(TransitionOutcome::Missing) => {
                tracing::warn!("Task has no status record; dropping delivery");
                self.settle_lease(lease, false).await;
                return ExecutionOutcome::Skipped;
            }
            Err(err) => {
                return self
                    .retry_or_fail(lease, ctx, JobError::Transient(format!("status store: {err:#}")))
                    .await;
            }
        }

        // Lowered when this delivery settles, whichever path it takes.
        let _active = self.telemetry.metrics().job_active(job_type);

        let Some(handler) = self.handlers.get(job_type) else {
            return self
                .settle_failure(
                    lease,
                    ctx,
                    JobError::Validation(format!("no handler registered for job type '{job_type}'")),
                )
                .await;
        };

        let job = JobContext {
            task_id,
            attempt: lease.attempt,
            correlation: Arc::clone(ctx),
        };
        let handled = AssertUnwindSafe(handler.handle(&job, envelope.payload.clone())).catch_unwind();
        let result = self
            .with_lease_renewal(lease, handled)
            .await
            .unwrap_or_else(|panic| {
                Err(JobError::Unexpected(format!(
                    "job handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match result {
            Ok(value) => self.settle_success(lease, ctx, value).await,
            Err(err) => self.retry_or_fail(lease, ctx, err).await,
        }
    }

    /// Drive `work` to completion, renewing the lease every third of its ttl
    /// so the housekeeper does not hand the job to another worker meanwhile.
    async fn with_lease_renewal<F: Future>(&self, lease: &JobLease, work: F) -> F::Output {
        let Some(every) = lease.renewal_interval() else {
            return work.await;
        };
        tokio::pin!(work);
        let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticks.tick() => match self.broker.renew(lease.lease_id, lease.ttl()).await {
                    Ok(expires_at) => tracing::debug!(expires_at = %expires_at, "Lease renewed"),
                    Err(err) => self.telemetry.report_degraded("broker", &err),
                },
            }
        }
    }

    async fn retry_or_fail(
        &self,
        lease: &JobLease,
        ctx: &Arc<RequestContext>,
        err: JobError,
    ) -> ExecutionOutcome {
        if !err.is_retryable() || self.retry.is_exhausted(lease.attempt) {
            return self.settle_failure(lease, ctx, err).await;
        }

        let delay = self.retry.compute_backoff(lease.attempt);
        tracing::warn!(
            error = %mask_url_credentials(err.message()),
            attempt = lease.attempt,
            max_attempts = self.retry.max_attempts,
            delay_ms = delay.num_milliseconds(),
            "Task failed transiently; retrying"
        );
        if let Err(broker_err) = self.broker.retry(lease.lease_id, delay).await {
            // The lease expires and the housekeeper requeues it.
            self.telemetry.report_degraded("broker", &broker_err);
        }
        ExecutionOutcome::Retrying {
            delay_ms: delay.num_milliseconds(),
        }
    }

    async fn settle_success(
        &self,
        lease: &JobLease,
        ctx: &Arc<RequestContext>,
        value: Value,
    ) -> ExecutionOutcome {
        let job_type = lease.envelope.job_type.as_str();

        match self.status.mark_succeeded(lease.envelope.task_id, value).await {
            Ok(outcome) if outcome.is_applied() => {}
            Ok(outcome) => {
                tracing::warn!(outcome = ?outcome, "Task result not recorded");
                self.settle_lease(lease, true).await;
                return ExecutionOutcome::Skipped;
            }
            Err(err) => {
                return self
                    .retry_or_fail(lease, ctx, JobError::Transient(format!("status store: {err:#}")))
                    .await;
            }
        }

        self.settle_lease(lease, true).await;
        let elapsed = ctx.elapsed();
        self.telemetry
            .record_job_event(job_type, JobLifecycleEvent::Succeeded);
        self.telemetry
            .metrics()
            .observe_job_duration(job_type, "success", elapsed.as_secs_f64());
        tracing::info!(
            status = "success",
            attempt = lease.attempt,
            "Task {job_type} completed"
        );
        ExecutionOutcome::Succeeded
    }

    async fn settle_failure(
        &self,
        lease: &JobLease,
        ctx: &Arc<RequestContext>,
        err: JobError,
    ) -> ExecutionOutcome {
        let job_type = lease.envelope.job_type.as_str();
        let failure = JobFailure {
            kind: err.kind().to_string(),
            message: mask_url_credentials(err.message()).into_owned(),
        };

        // A store error still counts: the lease is failed below and the job
        // is not delivered again.
        let counted = match self.status.mark_failed(lease.envelope.task_id, failure.clone()).await {
            Ok(outcome) => outcome.is_applied(),
            Err(store_err) => {
                self.telemetry.report_degraded("status_store", &store_err);
                true
            }
        };
        self.settle_lease(lease, false).await;

        if counted {
            let elapsed = ctx.elapsed();
            self.telemetry
                .record_job_event(job_type, JobLifecycleEvent::Failed);
            self.telemetry
                .metrics()
                .observe_job_duration(job_type, "failure", elapsed.as_secs_f64());
        }
        tracing::error!(
            status = "failure",
            error_kind = %failure.kind,
            error = %failure.message,
            attempt = lease.attempt,
            "Task {job_type} failed"
        );
        ExecutionOutcome::Failed { kind: failure.kind }
    }

    async fn settle_lease(&self, lease: &JobLease, success: bool) {
        let result = if success {
            self.broker.complete(lease.lease_id).await
        } else {
            self.broker.fail(lease.lease_id).await
        };
        if let Err(err) = result {
            self.telemetry.report_degraded("broker", &err);
        }
    }
}

/// Payload of a caught panic as text.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobEnvelope, JobRecord, TaskId};
    use crate::queue::InMemoryBroker;
    use crate::runtime::handler::JobHandler;
    use crate::status::InMemoryStatusStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Scripted {
        outcomes: Mutex<VecDeque<Result<Value, JobError>>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Value, JobError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn job_type(&self) -> &str {
            "scripted"
        }

        async fn handle(&self, _job: &JobContext, _payload: Value) -> Result<Value, JobError> {
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| panic!("handler called more often than scripted"))
        }
    }

    struct Harness {
        executor: JobExecutor,
        broker: InMemoryBroker,
        status: InMemoryStatusStore,
        telemetry: Telemetry,
    }

    fn harness(handler: Arc<dyn JobHandler>) -> Harness {
        let broker = InMemoryBroker::new();
        let status = InMemoryStatusStore::new();
        let telemetry = Telemetry::untraced("test").unwrap();
        let executor = JobExecutor::new(
            Arc::new(broker.clone()),
            Arc::new(status.clone()),
            Arc::new(HandlerRegistry::new().with(handler)),
            telemetry.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 0,
                max_backoff_ms: 0,
            },
        );
        Harness {
            executor,
            broker,
            status,
            telemetry,
        }
    }

    async fn submit(h: &Harness, job_type: &str) -> TaskId {
        let task_id = TaskId::new();
        h.status
            .insert_pending(JobRecord::pending(task_id, job_type, None))
            .await
            .unwrap();
        h.broker
            .enqueue(JobEnvelope::new(task_id, job_type, json!({})))
            .await
            .unwrap();
        task_id
    }

    async fn next_lease(h: &Harness) -> JobLease {
        h.broker
            .dequeue("w0", Duration::seconds(30))
            .await
            .unwrap()
            .expect("a job should be waiting")
    }

    #[tokio::test]
    async fn test_success_settles_and_counts() {
        let h = harness(Scripted::new(vec![Ok(json!({"count": 2}))]));
        let task_id = submit(&h, "scripted").await;

        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Succeeded);

        let record = h.status.get(task_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.result, Some(json!({"count": 2})));
        let metrics = h.telemetry.metrics();
        assert_eq!(metrics.job_count("scripted", JobLifecycleEvent::Started), 1);
        assert_eq!(metrics.job_count("scripted", JobLifecycleEvent::Succeeded), 1);
        assert_eq!(h.broker.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_retries_then_succeeds_without_regressing() {
        let h = harness(Scripted::new(vec![
            Err(JobError::Transient("db busy".into())),
            Ok(json!("done")),
        ]));
        let task_id = submit(&h, "scripted").await;

        let first = h.executor.execute(next_lease(&h).await).await;
        assert!(matches!(first, ExecutionOutcome::Retrying { .. }));
        assert_eq!(h.status.get(task_id).await.unwrap().unwrap().state, JobState::Started);

        let second = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(second, ExecutionOutcome::Succeeded);

        let metrics = h.telemetry.metrics();
        assert_eq!(metrics.job_count("scripted", JobLifecycleEvent::Started), 1);
        assert_eq!(metrics.job_count("scripted", JobLifecycleEvent::Succeeded), 1);
        assert_eq!(h.status.get(task_id).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_settles_failure() {
        let h = harness(Scripted::new(vec![
            Err(JobError::Transient("a".into())),
            Err(JobError::Transient("b".into())),
            Err(JobError::Transient("c".into())),
        ]));
        let task_id = submit(&h, "scripted").await;

        for _ in 0..2 {
            let outcome = h.executor.execute(next_lease(&h).await).await;
            assert!(matches!(outcome, ExecutionOutcome::Retrying { .. }));
        }
        let last = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(last, ExecutionOutcome::Failed { kind: "transient".into() });

        let record = h.status.get(task_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failure);
        assert_eq!(record.error.unwrap().message, "c");
        assert_eq!(h.broker.depth().await.unwrap(), 0);
        assert_eq!(
            h.telemetry.metrics().job_count("scripted", JobLifecycleEvent::Failed),
            1
        );
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let h = harness(Scripted::new(vec![Err(JobError::Validation("bad filters".into()))]));
        let task_id = submit(&h, "scripted").await;

        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Failed { kind: "validation".into() });
        assert_eq!(h.broker.depth().await.unwrap(), 0);
        assert_eq!(h.status.get(task_id).await.unwrap().unwrap().successful(), Some(false));
    }

    #[tokio::test]
    async fn test_unknown_job_type_fails_fast() {
        let h = harness(Scripted::new(vec![]));
        submit(&h, "mystery").await;

        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Failed { kind: "validation".into() });
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let h = harness(Scripted::new(vec![]));
        let task_id = submit(&h, "scripted").await;

        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Failed { kind: "unexpected".into() });
        let record = h.status.get(task_id).await.unwrap().unwrap();
        assert!(record.error.unwrap().message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let h = harness(Scripted::new(vec![Ok(json!(1))]));
        let task_id = submit(&h, "scripted").await;
        h.executor.execute(next_lease(&h).await).await;

        h.broker
            .enqueue(JobEnvelope::new(task_id, "scripted", json!({})))
            .await
            .unwrap();
        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Skipped);
        assert_eq!(
            h.telemetry.metrics().job_count("scripted", JobLifecycleEvent::Succeeded),
            1
        );
    }

    /// Status store whose writes can be made to error or be rejected.
    #[derive(Default)]
    struct FaultyStatus {
        inner: InMemoryStatusStore,
        fail_started: AtomicBool,
        reject_succeeded: AtomicBool,
        fail_failed: AtomicBool,
    }

    #[async_trait]
    impl StatusStore for FaultyStatus {
        async fn insert_pending(&self, record: JobRecord) -> anyhow::Result<()> {
            self.inner.insert_pending(record).await
        }

        async fn mark_started(&self, task_id: TaskId, attempt: u32) -> anyhow::Result<TransitionOutcome> {
            if self.fail_started.load(Ordering::SeqCst) {
                anyhow::bail!("status store unreachable");
            }
            self.inner.mark_started(task_id, attempt).await
        }

        async fn mark_succeeded(&self, task_id: TaskId, result: Value) -> anyhow::Result<TransitionOutcome> {
            if self.reject_succeeded.load(Ordering::SeqCst) {
                return Ok(TransitionOutcome::Rejected { current: JobState::Failure });
            }
            self.inner.mark_succeeded(task_id, result).await
        }

        async fn mark_failed(&self, task_id: TaskId, failure: JobFailure) -> anyhow::Result<TransitionOutcome> {
            if self.fail_failed.load(Ordering::SeqCst) {
                anyhow::bail!("status store unreachable");
            }
            self.inner.mark_failed(task_id, failure).await
        }

        async fn get(&self, task_id: TaskId) -> anyhow::Result<Option<JobRecord>> {
            self.inner.get(task_id).await
        }

        async fn purge_expired(&self, finished_before: DateTime<Utc>) -> anyhow::Result<u64> {
            self.inner.purge_expired(finished_before).await
        }
    }

    fn faulty_harness(handler: Arc<dyn JobHandler>, max_attempts: u32) -> (Harness, Arc<FaultyStatus>) {
        let broker = InMemoryBroker::new();
        let status = Arc::new(FaultyStatus::default());
        let telemetry = Telemetry::untraced("test").unwrap();
        let executor = JobExecutor::new(
            Arc::new(broker.clone()),
            status.clone(),
            Arc::new(HandlerRegistry::new().with(handler)),
            telemetry.clone(),
            RetryPolicy {
                max_attempts,
                base_delay_ms: 0,
                max_backoff_ms: 0,
            },
        );
        let harness = Harness {
            executor,
            broker,
            status: status.inner.clone(),
            telemetry,
        };
        (harness, status)
    }

    #[tokio::test]
    async fn test_active_gauge_untouched_when_start_cannot_be_recorded() {
        let (h, status) = faulty_harness(Scripted::new(vec![]), 1);
        submit(&h, "scripted").await;
        status.fail_started.store(true, Ordering::SeqCst);

        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Failed { kind: "transient".into() });

        let metrics = h.telemetry.metrics();
        assert_eq!(metrics.active_jobs("scripted"), 0);
        assert_eq!(metrics.job_count("scripted", JobLifecycleEvent::Started), 0);
    }

    #[tokio::test]
    async fn test_active_gauge_drops_when_result_is_not_recorded() {
        let (h, status) = faulty_harness(Scripted::new(vec![Ok(json!(1))]), 3);
        submit(&h, "scripted").await;
        status.reject_succeeded.store(true, Ordering::SeqCst);

        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Skipped);

        let metrics = h.telemetry.metrics();
        assert_eq!(metrics.job_count("scripted", JobLifecycleEvent::Started), 1);
        assert_eq!(metrics.active_jobs("scripted"), 0);
        assert_eq!(h.broker.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_counted_when_store_write_errors() {
        let (h, status) = faulty_harness(
            Scripted::new(vec![Err(JobError::Validation("bad filters".into()))]),
            3,
        );
        submit(&h, "scripted").await;
        status.fail_failed.store(true, Ordering::SeqCst);

        let outcome = h.executor.execute(next_lease(&h).await).await;
        assert_eq!(outcome, ExecutionOutcome::Failed { kind: "validation".into() });

        let metrics = h.telemetry.metrics();
        assert_eq!(metrics.job_count("scripted", JobLifecycleEvent::Failed), 1);
        assert_eq!(metrics.active_jobs("scripted"), 0);
        assert_eq!(h.broker.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_active_gauge_raised_only_while_running() {
        let h = harness(Scripted::new(vec![
            Err(JobError::Transient("db busy".into())),
            Ok(json!(1)),
        ]));
        submit(&h, "scripted").await;

        h.executor.execute(next_lease(&h).await).await;
        assert_eq!(h.telemetry.metrics().active_jobs("scripted"), 0);
        h.executor.execute(next_lease(&h).await).await;
        assert_eq!(h.telemetry.metrics().active_jobs("scripted"), 0);
    }

    struct Sleepy(std::time::Duration);

    #[async_trait]
    impl JobHandler for Sleepy {
        fn job_type(&self) -> &str {
            "sleepy"
        }

        async fn handle(&self, _job: &JobContext, _payload: Value) -> Result<Value, JobError> {
            tokio::time::sleep(self.0).await;
            Ok(json!("slept"))
        }
    }

    #[tokio::test]
    async fn test_lease_renewed_while_handler_runs() {
        let h = harness(Arc::new(Sleepy(std::time::Duration::from_millis(900))));
        submit(&h, "sleepy").await;
        let lease = h
            .broker
            .dequeue("w0", Duration::milliseconds(300))
            .await
            .unwrap()
            .unwrap();

        let executor = h.executor.clone();
        let running = tokio::spawn(async move { executor.execute(lease).await });

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert_eq!(h.broker.reclaim_expired().await.unwrap(), 0);
        assert_eq!(h.telemetry.metrics().active_jobs("sleepy"), 1);

        assert_eq!(running.await.unwrap(), ExecutionOutcome::Succeeded);
        assert_eq!(h.broker.leased_count(), 0);
    }
}
