//! Telemetry wiring shared by the HTTP tier and the worker pool.
//!
//! [`Telemetry`] bundles the metrics registry and the trace propagator that
//! were selected once at startup. It owns the request lifecycle:
//! [`Telemetry::begin_request`] creates the correlation context and the
//! returned [`RequestGuard`] performs the end-of-request bookkeeping exactly
//! once, either through [`RequestGuard::finish`] or when it is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::correlation::{self, JobScope, RequestContext, RequestId};
use crate::job::JobEnvelope;
use crate::metrics::{JobLifecycleEvent, MetricsRegistry};
use crate::propagation::{
    ActiveSpan, NoopPropagator, OtelPropagator, SpanOutcome, SpanRole, TraceCarrier,
    TracePropagator,
};

/// Status label recorded for requests whose future was dropped before a response existed.
pub const ABORTED_STATUS: u16 = 499;

/// Rate limiter for degraded-mode warnings.
///
/// The first failure in a window is reported; later ones are counted and the
/// count is handed to the next report.
#[derive(Clone, Debug)]
pub struct FailureWindow {
    window: Duration,
    state: Arc<Mutex<WindowState>>,
}

#[derive(Debug, Default)]
struct WindowState {
    last_reported: Option<Instant>,
    suppressed: u64,
}

impl Default for FailureWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl FailureWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(WindowState::default())),
        }
    }

    /// `Some(suppressed_since_last_report)` when this failure should be logged.
    pub fn should_report(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.last_reported {
            Some(last) if now.duration_since(last) < self.window => {
                state.suppressed += 1;
                None
            }
            _ => {
                state.last_reported = Some(now);
                Some(std::mem::take(&mut state.suppressed))
            }
        }
    }
}

/// Metrics registry plus trace propagator, cheap to clone.
#[derive(Clone)]
pub struct Telemetry {
    metrics: Arc<MetricsRegistry>,
    propagator: Arc<dyn TracePropagator>,
    degraded: FailureWindow,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("environment", &self.metrics.environment())
            .field("tracing_enabled", &self.propagator.is_enabled())
            .finish()
    }
}

impl Telemetry {
    pub fn new(metrics: Arc<MetricsRegistry>, propagator: Arc<dyn TracePropagator>) -> Self {
        Self {
            metrics,
            propagator,
            degraded: FailureWindow::default(),
        }
    }

    /// Build the registry and pick the propagator from configuration.
    ///
    /// A propagator that cannot be built leaves tracing disabled; startup continues.
    pub fn init(config: &AppConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(MetricsRegistry::new(
            &config.environment,
            &config.app_version,
        )?);

        let propagator: Arc<dyn TracePropagator> = if config.tracing_enabled {
            match OtelPropagator::new(&config.otel, &config.environment) {
                Ok(otel) => {
                    tracing::info!(
                        endpoint = %config.otel.traces_url(),
                        service = %config.otel.service_name,
                        "Tracing enabled"
                    );
                    Arc::new(otel)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Tracing requested but exporter setup failed; continuing without traces");
                    Arc::new(NoopPropagator)
                }
            }
        } else {
            tracing::info!("Tracing disabled");
            Arc::new(NoopPropagator)
        };

        Ok(Self::new(metrics, propagator))
    }

    /// Tracing disabled, fresh registry.
    pub fn untraced(environment: &str) -> anyhow::Result<Self> {
        let metrics = Arc::new(MetricsRegistry::new(environment, env!("CARGO_PKG_VERSION"))?);
        Ok(Self::new(metrics, Arc::new(NoopPropagator)))
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn propagator(&self) -> &Arc<dyn TracePropagator> {
        &self.propagator
    }

    pub fn tracing_enabled(&self) -> bool {
        self.propagator.is_enabled()
    }

    /// Start bookkeeping for an inbound request.
    ///
    /// When a context is already installed for the current task the guard
    /// reuses it and performs no bookkeeping of its own.
    pub fn begin_request(
        &self,
        method: &str,
        route: &str,
        path: &str,
        inbound: Option<&TraceCarrier>,
    ) -> RequestGuard {
        if let Some(existing) = correlation::current() {
            return RequestGuard {
                ctx: existing,
                pending: None,
            };
        }

        let parent = inbound.and_then(|carrier| self.propagator.extract(carrier));
        let span = self.propagator.start_span(
            &format!("{method} {route}"),
            SpanRole::Server,
            parent.as_ref(),
        );

        let mut ctx = RequestContext::new(RequestId::new());
        if let Some(span) = &span {
            span.set_attribute("http.method", method.to_string());
            span.set_attribute("http.route", route.to_string());
            span.set_attribute("http.target", path.to_string());
            span.set_attribute("request_id", ctx.request_id().to_string());
            let carrier = self.propagator.inject(span);
            ctx = ctx.with_trace(span.ids().clone(), carrier);
        }

        RequestGuard {
            ctx: Arc::new(ctx),
            pending: Some(Bookkeeping {
                telemetry: self.clone(),
                span,
                method: method.to_string(),
                route: route.to_string(),
                path: path.to_string(),
            }),
        }
    }

    /// Rebuild a correlation context for a job from its envelope.
    ///
    /// The job keeps the originating request id so its log lines join the
    /// request's; a missing or unreadable carrier starts a fresh trace.
    pub fn begin_job(&self, envelope: &JobEnvelope, attempt: u32) -> (Arc<RequestContext>, Option<ActiveSpan>) {
        let parent = envelope
            .carrier
            .as_ref()
            .and_then(|carrier| self.propagator.extract(carrier));
        let span = self.propagator.start_span(
            &format!("job {}", envelope.job_type),
            SpanRole::Consumer,
            parent.as_ref(),
        );

        let request_id = envelope.request_id.unwrap_or_default();
        let mut ctx = RequestContext::new(request_id).with_job(JobScope {
            task_id: envelope.task_id,
            job_type: envelope.job_type.clone(),
            attempt,
        });
        if let Some(span) = &span {
            span.set_attribute("job.type", envelope.job_type.clone());
            span.set_attribute("job.task_id", envelope.task_id.to_string());
            span.set_attribute("job.attempt", i64::from(attempt));
            let carrier = self.propagator.inject(span);
            ctx = ctx.with_trace(span.ids().clone(), carrier);
        }
        (Arc::new(ctx), span)
    }

    /// Log a job lifecycle event and count it.
    pub fn record_job_event(&self, job_type: &str, event: JobLifecycleEvent) {
        tracing::debug!(job_type = %job_type, event = %event.as_str(), "job event");
        self.metrics.increment_job(job_type, event);
    }

    /// Report a failure in an observability or infrastructure side path.
    ///
    /// Logged at most once per failure window; never propagated.
    pub fn report_degraded(&self, component: &str, err: &anyhow::Error) {
        if let Some(suppressed) = self.degraded.should_report() {
            tracing::warn!(
                component = %component,
                error = %format!("{err:#}"),
                suppressed = suppressed,
                "Running degraded"
            );
        }
    }

    /// Flush buffered spans.
    pub fn shutdown(&self) {
        if let Err(err) = self.propagator.shutdown() {
            self.report_degraded("tracing", &err);
        }
    }
}

struct Bookkeeping {
    telemetry: Telemetry,
    span: Option<ActiveSpan>,
    method: String,
    route: String,
    path: String,
}

/// End-of-request bookkeeping that runs exactly once.
///
/// Dropping an unfinished guard records the request as aborted.
#[must_use = "dropping the guard immediately ends the request"]
pub struct RequestGuard {
    ctx: Arc<RequestContext>,
    pending: Option<Bookkeeping>,
}

impl fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("ctx", &self.ctx)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl RequestGuard {
    pub fn context(&self) -> Arc<RequestContext> {
        Arc::clone(&self.ctx)
    }

    /// True when this guard reused an enclosing context.
    pub fn is_nested(&self) -> bool {
        self.pending.is_none()
    }

    /// Record the request's outcome. Returns the elapsed time in milliseconds.
    pub fn finish(mut self, status: u16) -> f64 {
        self.complete(status, false)
    }

    fn complete(&mut self, status: u16, aborted: bool) -> f64 {
        let elapsed = self.ctx.elapsed();
        let duration_ms = elapsed.as_secs_f64() * 1000.0;

        let Some(bookkeeping) = self.pending.take() else {
            return duration_ms;
        };
        let Bookkeeping {
            telemetry,
            span,
            method,
            route,
            path,
        } = bookkeeping;

        telemetry
            .metrics
            .observe_http(&method, &route, status, elapsed.as_secs_f64());

        if let Some(span) = span {
            span.set_attribute("http.status_code", i64::from(status));
            let outcome = if aborted {
                SpanOutcome::Error("request aborted".to_string())
            } else if status >= 500 {
                SpanOutcome::Error(format!("HTTP {status}"))
            } else {
                SpanOutcome::Ok
            };
            span.end(outcome);
        }

        correlation::sync_scope(Arc::clone(&self.ctx), || {
            if aborted {
                tracing::warn!(
                    http.method = %method,
                    http.path = %path,
                    status_code = status,
                    "Request aborted: {method} {path}"
                );
            } else {
                tracing::info!(
                    http.method = %method,
                    http.path = %path,
                    status_code = status,
                    "Request completed: {method} {path}"
                );
            }
        });

        duration_ms
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.pending.is_some() {
            self.complete(ABORTED_STATUS, true);
        }
    }
}
