use std::sync::Arc;

use axum::Router;
use lantern::app::{build_state, job_handlers, Backend};
use lantern::config::AppConfig;
use lantern::http::{self, AppState};
use lantern::lease::RetryPolicy;
use lantern::queue::JobBroker;
use lantern::runtime::{ExecutionOutcome, HandlerRegistry, JobExecutor, JobHandler};
use lantern::telemetry::Telemetry;
use lantern::todo::TodoRepository;
use tempfile::TempDir;

/// Insert `texts` in order, so the last one is newest.
pub async fn seed_todos(repo: &dyn TodoRepository, texts: &[&str]) -> anyhow::Result<()> {
    for text in texts {
        repo.add(text).await?;
    }
    Ok(())
}

/// In-memory application with everything a test needs to drive requests
/// and run the jobs they enqueue.
pub struct TestApp {
    pub config: AppConfig,
    pub telemetry: Telemetry,
    pub backend: Backend,
    pub state: AppState,
    pub executor: JobExecutor,
    // Keeps the export directory alive for the test's duration.
    _export_dir: TempDir,
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder::default()
    }

    /// Default in-memory app with tracing disabled.
    pub fn new() -> anyhow::Result<Self> {
        Self::builder().build()
    }

    pub fn router(&self) -> Router {
        http::router(self.state.clone())
    }

    /// Lease and execute jobs until the broker has nothing ready.
    pub async fn run_pending_jobs(&self) -> anyhow::Result<Vec<ExecutionOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(lease) = self
            .backend
            .broker
            .dequeue("test-worker", chrono::Duration::seconds(30))
            .await?
        {
            outcomes.push(self.executor.execute(lease).await);
        }
        Ok(outcomes)
    }
}

#[derive(Default)]
pub struct TestAppBuilder {
    telemetry: Option<Telemetry>,
    broker: Option<Arc<dyn JobBroker>>,
    handlers: Vec<Arc<dyn JobHandler>>,
    retry: Option<RetryPolicy>,
}

impl TestAppBuilder {
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn JobBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Extra handler, registered after the built-in ones.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> anyhow::Result<TestApp> {
        let export_dir = tempfile::tempdir()?;
        let config = AppConfig {
            environment: "test".to_string(),
            export_dir: export_dir.path().to_path_buf(),
            // Retries become due immediately so tests can drain the broker in one pass.
            retry: self.retry.unwrap_or(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 0,
                max_backoff_ms: 0,
            }),
            ..Default::default()
        };

        let telemetry = match self.telemetry {
            Some(telemetry) => telemetry,
            None => Telemetry::untraced(&config.environment)?,
        };

        let mut backend = Backend::in_memory();
        if let Some(broker) = self.broker {
            backend.broker = broker;
        }

        let mut handlers: HandlerRegistry = job_handlers(&config, Arc::clone(&backend.todos));
        for handler in self.handlers {
            handlers.register(handler);
        }

        let executor = JobExecutor::new(
            Arc::clone(&backend.broker),
            Arc::clone(&backend.status),
            Arc::new(handlers),
            telemetry.clone(),
            config.retry.clone(),
        );
        let state = build_state(&config, &telemetry, &backend);

        Ok(TestApp {
            config,
            telemetry,
            backend,
            state,
            executor,
            _export_dir: export_dir,
        })
    }
}
