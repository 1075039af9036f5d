use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, Notify};

use crate::lease::RetryPolicy;
use crate::queue::JobBroker;
use crate::status::StatusStore;

use super::executor::JobExecutor;
use super::worker::WorkerConfig;

/// Configuration for the worker pool.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub pool_size: usize,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    /// Interval between housekeeper runs in milliseconds.
    pub housekeeper_interval_ms: u64,
    /// Terminal job records older than this are purged.
    pub result_ttl: StdDuration,
    /// How long shutdown waits for each worker to finish its current job.
    pub shutdown_timeout: StdDuration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            worker: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            housekeeper_interval_ms: 5000,
            result_ttl: StdDuration::from_secs(24 * 60 * 60),
            shutdown_timeout: StdDuration::from_secs(30),
        }
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of background workers draining the broker.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    executor: JobExecutor,
    status: Arc<dyn StatusStore>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, executor: JobExecutor, status: Arc<dyn StatusStore>) -> Self {
        Self {
            config,
            executor,
            status,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawn the configured number of workers and the housekeeper.
    pub async fn start(&self) {
        self.spawn_workers(self.config.pool_size).await;
        self.spawn_housekeeper().await;
        tracing::info!(
            workers = self.config.pool_size,
            max_attempts = self.config.retry.max_attempts,
            "Worker pool started"
        );
    }

    /// Gracefully shut down the pool. Jobs in flight run to completion.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of worker pool");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => tracing::warn!("Worker task timed out during shutdown"),
            }
        }

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }

    /// Spawn `parallelism` workers.
    pub async fn spawn_workers(&self, parallelism: usize) {
        let worker_group = format!("{}-{}", self.config.worker.worker_group, std::process::id());
        let mut handles = self.worker_handles.lock().await;
        let offset = handles.len();

        for i in 0..parallelism {
            let worker_id = format!("{}-w{}", worker_group, offset + i);
            let executor = self.executor.clone();
            let shutdown = self.shutdown_token.clone();
            let config = self.config.worker.clone();

            handles.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, executor, shutdown, config).await;
            }));
        }
    }

    /// Spawn the housekeeper: reclaims expired leases and purges old job records.
    pub async fn spawn_housekeeper(&self) {
        let broker = Arc::clone(self.executor.broker());
        let status = Arc::clone(&self.status);
        let telemetry = self.executor.telemetry().clone();
        let interval = StdDuration::from_millis(self.config.housekeeper_interval_ms);
        let ttl = Duration::from_std(self.config.result_ttl).unwrap_or_else(|_| Duration::days(1));
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match broker.reclaim_expired().await {
                            Ok(0) => {}
                            Ok(n) => tracing::warn!(reclaimed = n, "Requeued jobs with expired leases"),
                            Err(err) => telemetry.report_degraded("broker", &err),
                        }
                        match status.purge_expired(Utc::now() - ttl).await {
                            Ok(0) => {}
                            Ok(n) => tracing::debug!(purged = n, "Purged expired job records"),
                            Err(err) => telemetry.report_degraded("status_store", &err),
                        }
                    }
                }
            }
        });
        self.worker_handles.lock().await.push(handle);
    }

    async fn worker_loop(
        worker_id: String,
        executor: JobExecutor,
        shutdown: ShutdownToken,
        config: WorkerConfig,
    ) {
        let lease_ttl = Duration::seconds(config.lease_ttl_secs);
        let poll_interval = StdDuration::from_millis(config.poll_interval_ms);
        let backoff = StdDuration::from_millis(config.backoff_ms);

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Worker {} shutting down", worker_id);
                break;
            }

            match executor.broker().dequeue(&worker_id, lease_ttl).await {
                Ok(Some(lease)) => {
                    executor.execute(lease).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(err) => {
                    executor.telemetry().report_degraded("broker", &err);
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
