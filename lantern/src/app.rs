//! Process wiring for the `serve`, `worker` and `all` modes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;

use crate::config::AppConfig;
use crate::dispatch::JobDispatcher;
use crate::export::ExportHandler;
use crate::http::{self, AppState};
use crate::queue::{InMemoryBroker, JobBroker};
use crate::runtime::{HandlerRegistry, WorkerPool, WorkerPoolBuilder, WorkerPoolConfig};
use crate::status::{InMemoryStatusStore, StatusStore};
use crate::telemetry::Telemetry;
use crate::todo::{InMemoryTodoRepository, TodoRepository};

/// Storage shared by the HTTP tier and the workers.
#[derive(Clone)]
pub struct Backend {
    pub broker: Arc<dyn JobBroker>,
    pub status: Arc<dyn StatusStore>,
    pub todos: Arc<dyn TodoRepository>,
    pub durable: bool,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("durable", &self.durable)
            .finish()
    }
}

impl Backend {
    /// Process-local stores. Nothing is shared with other processes.
    pub fn in_memory() -> Self {
        let broker = InMemoryBroker::new();
        Self {
            broker: Arc::new(broker),
            status: Arc::new(InMemoryStatusStore::new()),
            todos: Arc::new(InMemoryTodoRepository::new()),
            durable: false,
        }
    }

    /// Postgres when a database is configured, in-memory otherwise.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let Some(persistence) = &config.persistence else {
            tracing::info!("No DATABASE_URL configured, using in-memory stores");
            return Ok(Self::in_memory());
        };

        #[cfg(feature = "postgres")]
        {
            use crate::persistence::{connect, ensure_schema, PostgresJobStore, PostgresTodoRepository};

            let pool = connect(persistence).await?;
            ensure_schema(&pool).await?;
            let jobs = Arc::new(PostgresJobStore::new(pool.clone()));
            Ok(Self {
                broker: jobs.clone(),
                status: jobs,
                todos: Arc::new(PostgresTodoRepository::new(pool)),
                durable: true,
            })
        }

        #[cfg(not(feature = "postgres"))]
        {
            anyhow::bail!(
                "DATABASE_URL is set ({}) but lantern was built without the `postgres` feature",
                persistence.masked_connection_string()
            )
        }
    }
}

/// Handlers for every job type this service runs.
pub fn job_handlers(config: &AppConfig, todos: Arc<dyn TodoRepository>) -> HandlerRegistry {
    HandlerRegistry::new().with(Arc::new(
        ExportHandler::new(todos, config.export_dir.clone()).with_delay(config.export_delay),
    ))
}

pub fn build_worker_pool(config: &AppConfig, telemetry: &Telemetry, backend: &Backend) -> anyhow::Result<WorkerPool> {
    let pool_config = WorkerPoolConfig {
        pool_size: config.worker_pool_size,
        retry: config.retry.clone(),
        result_ttl: config.job_result_ttl,
        ..Default::default()
    };
    WorkerPoolBuilder::new(pool_config)
        .with_broker(Arc::clone(&backend.broker))
        .with_status_store(Arc::clone(&backend.status))
        .with_handlers(job_handlers(config, Arc::clone(&backend.todos)))
        .with_telemetry(telemetry.clone())
        .build()
}

pub fn build_state(config: &AppConfig, telemetry: &Telemetry, backend: &Backend) -> AppState {
    AppState {
        telemetry: telemetry.clone(),
        todos: Arc::clone(&backend.todos),
        dispatcher: JobDispatcher::new(
            Arc::clone(&backend.broker),
            Arc::clone(&backend.status),
            telemetry.clone(),
        ),
        export_dir: config.export_dir.clone(),
    }
}

/// HTTP tier only.
pub async fn run_serve(config: &AppConfig, telemetry: &Telemetry, backend: &Backend) -> anyhow::Result<()> {
    if !backend.durable {
        tracing::warn!("Serving with in-memory stores; jobs are only run by workers in this process");
    }
    serve(config, telemetry, backend).await
}

/// Job tier only.
pub async fn run_worker(config: &AppConfig, telemetry: &Telemetry, backend: &Backend) -> anyhow::Result<()> {
    if !backend.durable {
        tracing::warn!("Worker started with in-memory stores; it only sees jobs enqueued by this process");
    }
    let pool = build_worker_pool(config, telemetry, backend)?;
    pool.start().await;
    shutdown_signal().await;
    pool.shutdown().await
}

/// HTTP tier and workers in one process.
pub async fn run_all(config: &AppConfig, telemetry: &Telemetry, backend: &Backend) -> anyhow::Result<()> {
    let pool = build_worker_pool(config, telemetry, backend)?;
    pool.start().await;

    let served = serve(config, telemetry, backend).await;
    pool.shutdown().await?;
    served
}

async fn serve(config: &AppConfig, telemetry: &Telemetry, backend: &Backend) -> anyhow::Result<()> {
    let router = http::router(build_state(config, telemetry, backend));
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("binding {} failed: {e}", config.bind_addr))?;

    tracing::info!(
        bind_addr = %config.bind_addr,
        tracing_enabled = telemetry.tracing_enabled(),
        environment = %config.environment,
        "HTTP server listening"
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to register ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
