//! Lantern - request correlation and telemetry propagation for a to-do service.
//!
//! Every inbound request gets one request id that shows up in its response
//! header, in every log line it produces and in every background job it
//! enqueues. Structured JSON logs, Prometheus metrics and (optionally)
//! OpenTelemetry traces all hang off that one correlation context.
//!
//! # Core Concepts
//!
//! - **Correlation**: [`RequestContext`] lives in a task-local slot for the
//!   lifetime of a request or job; [`correlation::current`] reads it from
//!   anywhere below.
//!
//! - **Telemetry**: [`Telemetry`] owns the [`MetricsRegistry`] and the
//!   [`TracePropagator`] chosen at startup. Tracing is feature-flagged and
//!   degrades to a no-op when the collector cannot be reached.
//!
//! - **Jobs**: [`JobDispatcher`] records a task, embeds the caller's
//!   correlation in a [`JobEnvelope`] and hands it to a [`JobBroker`].
//!   A [`WorkerPool`] leases envelopes, restores the correlation and runs the
//!   registered [`JobHandler`].
//!
//! - **HTTP**: [`http::router`] wires the to-do pages, the export API, health
//!   checks and `/metrics` behind the correlation middleware.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL broker, status store and to-do repository via sqlx
//!
//! # Example
//!
//! ```ignore
//! use lantern::prelude::*;
//!
//! let config = AppConfig::from_env()?;
//! init_logging(config.log_level)?;
//! let telemetry = Telemetry::init(&config)?;
//! let backend = Backend::connect(&config).await?;
//! app::run_all(&config, &telemetry, &backend).await?;
//! ```

/// Process wiring for the `serve`, `worker` and `all` modes.
pub mod app;

/// Typed configuration loaded from the environment.
///
/// [`AppConfig`] is validated once at startup; bad values surface as
/// [`ConfigError`] instead of being discovered mid-request.
pub mod config;

/// Task-local correlation context.
///
/// Provides [`RequestId`], [`RequestContext`] and the scope helpers that make
/// the active context visible to logging, metrics and job dispatch.
pub mod correlation;

/// Job dispatch boundary used by request handlers.
pub mod dispatch;

/// Typed errors for the job layer and the HTTP boundary.
pub mod error;

/// CSV export of to-do rows, run as a background job.
pub mod export;

/// HTTP surface and the correlation middleware.
pub mod http;

/// Job identities, states and the envelope that crosses the broker.
///
/// - [`Job`] - typed job payloads
/// - [`TaskId`] - client-facing task identifier
/// - [`JobState`] - PENDING, STARTED, SUCCESS, FAILURE; forward only
/// - [`JobRecord`] - status-store row
/// - [`JobEnvelope`] - what the broker carries
pub mod job;

/// Leases and retry policy.
pub mod lease;

/// Structured JSON log emitter.
///
/// [`JsonLogLayer`] renders one flat JSON object per line with the active
/// correlation fields and redacts sensitive attributes.
pub mod logging;

/// Prometheus metrics owned by [`MetricsRegistry`].
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides PostgreSQL-backed implementations of
/// the broker, the status store and the to-do repository when the
/// `postgres` feature is enabled.
pub mod persistence;

/// W3C trace-context propagation behind the [`TracePropagator`] trait.
pub mod propagation;

/// Broker trait and the in-memory broker.
pub mod queue;

/// Worker pool, job executor and handler registry.
///
/// - [`WorkerPool`] - supervises workers and the housekeeper
/// - [`WorkerPoolBuilder`] - validated construction
/// - [`JobExecutor`] - runs one lease through the job state machine
/// - [`JobHandler`] / [`HandlerRegistry`] - per-job-type execution
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

/// Job status store trait and the in-memory store.
pub mod status;

/// Request and job bookkeeping shared by both tiers.
pub mod telemetry;

/// To-do rows and their repository.
pub mod todo;

pub use app::Backend;
pub use config::{AppConfig, ConfigError, LogLevel, OtelConfig, PersistenceConfig};
pub use correlation::{RequestContext, RequestId};
pub use dispatch::{JobDispatcher, JobStatus};
pub use error::{ApiError, DispatchError, JobError};
pub use job::{Job, JobEnvelope, JobFailure, JobRecord, JobState, TaskId};
pub use lease::{JobLease, LeaseId, RetryPolicy};
pub use logging::{init_logging, JsonLogLayer, Redactor};
pub use metrics::{ActiveJobGuard, JobLifecycleEvent, MetricsRegistry};
pub use propagation::{NoopPropagator, OtelPropagator, TraceCarrier, TracePropagator};
pub use queue::{InMemoryBroker, JobBroker};
pub use runtime::{
    ExecutionOutcome, HandlerRegistry, JobContext, JobExecutor, JobHandler, ShutdownToken,
    WorkerConfig, WorkerPool, WorkerPoolBuilder, WorkerPoolConfig,
};
pub use status::{InMemoryStatusStore, StatusStore, TransitionOutcome};
pub use telemetry::{RequestGuard, Telemetry};

/// Common imports for binaries and tests.
pub mod prelude {
    pub use crate::app::{self, Backend};
    pub use crate::config::AppConfig;
    pub use crate::logging::init_logging;
    pub use crate::telemetry::Telemetry;
}
