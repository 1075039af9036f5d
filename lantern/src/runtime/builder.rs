use std::fmt;
use std::sync::Arc;

use crate::queue::JobBroker;
use crate::status::StatusStore;
use crate::telemetry::Telemetry;

use super::executor::JobExecutor;
use super::handler::HandlerRegistry;
use super::supervisor::{WorkerPool, WorkerPoolConfig};

/// Builder for constructing a [`WorkerPool`] with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the pool. Each dependency is configured via a `with_*` method.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPoolBuilder::new(config)
///     .with_broker(broker)
///     .with_status_store(status)
///     .with_handlers(handlers)
///     .with_telemetry(telemetry)
///     .build()?;
/// pool.start().await;
/// ```
pub struct WorkerPoolBuilder {
    config: WorkerPoolConfig,
    broker: Option<Arc<dyn JobBroker>>,
    status: Option<Arc<dyn StatusStore>>,
    handlers: Option<HandlerRegistry>,
    telemetry: Option<Telemetry>,
}

impl fmt::Debug for WorkerPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolBuilder")
            .field("config", &self.config)
            .field("broker_set", &self.broker.is_some())
            .field("status_set", &self.status.is_some())
            .field("handlers", &self.handlers)
            .field("telemetry_set", &self.telemetry.is_some())
            .finish()
    }
}

impl WorkerPoolBuilder {
    /// Create a new builder with the given pool configuration.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            broker: None,
            status: None,
            handlers: None,
            telemetry: None,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn JobBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_status_store(mut self, status: Arc<dyn StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build the pool, validating that all dependencies are present.
    pub fn build(self) -> anyhow::Result<WorkerPool> {
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("Broker dependency missing"))?;
        let status = self
            .status
            .ok_or_else(|| anyhow::anyhow!("Status store dependency missing"))?;
        let handlers = self
            .handlers
            .ok_or_else(|| anyhow::anyhow!("Handler registry dependency missing"))?;
        let telemetry = self
            .telemetry
            .ok_or_else(|| anyhow::anyhow!("Telemetry dependency missing"))?;

        if self.config.pool_size == 0 {
            anyhow::bail!("worker pool size must be at least 1");
        }
        if handlers.job_types().is_empty() {
            tracing::warn!("Worker pool built without any job handlers");
        }

        let executor = JobExecutor::new(
            broker,
            Arc::clone(&status),
            Arc::new(handlers),
            telemetry,
            self.config.retry.clone(),
        );
        Ok(WorkerPool::new(self.config, executor, status))
    }
}
