//! Prometheus metrics.
//!
//! One [`MetricsRegistry`] is built at process start and shared by `Arc`.
//! All series are registered on its own `prometheus::Registry`, so tests can
//! build isolated registries side by side.
//!
//! # Metrics
//!
//! ## Counters
//! - `background_jobs_total{job_type,status}` - job lifecycle events
//!   (`enqueued`, `started`, `succeeded`, `failed`)
//!
//! ## Gauges
//! - `background_jobs_active{job_type}` - jobs currently executing
//! - `app_info{version,environment}` - constant 1
//!
//! ## Histograms
//! - `http_request_duration_seconds{method,endpoint,status,environment}`
//! - `background_job_duration_seconds{job_type,status}`

use std::fmt;

use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};

/// Latency buckets for HTTP requests, in seconds.
pub const HTTP_LATENCY_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Points in a job's life that are counted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobLifecycleEvent {
    Enqueued,
    Started,
    Succeeded,
    Failed,
}

impl JobLifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobLifecycleEvent::Enqueued => "enqueued",
            JobLifecycleEvent::Started => "started",
            JobLifecycleEvent::Succeeded => "succeeded",
            JobLifecycleEvent::Failed => "failed",
        }
    }
}

impl fmt::Display for JobLifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct MetricsRegistry {
    registry: Registry,
    environment: String,
    http_request_duration: HistogramVec,
    background_jobs: IntCounterVec,
    background_jobs_active: IntGaugeVec,
    job_duration: HistogramVec,
}

/// One executing delivery, counted in `background_jobs_active`.
#[must_use = "the job stops counting as active when the guard drops"]
#[derive(Debug)]
pub struct ActiveJobGuard {
    gauge: IntGauge,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("environment", &self.environment)
            .finish()
    }
}

impl MetricsRegistry {
    /// Create and register every series.
    pub fn new(environment: &str, version: &str) -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(HTTP_LATENCY_BUCKETS.to_vec()),
            &["method", "endpoint", "status", "environment"],
        )?;

        let background_jobs = IntCounterVec::new(
            Opts::new("background_jobs_total", "Background job lifecycle events"),
            &["job_type", "status"],
        )?;

        let background_jobs_active = IntGaugeVec::new(
            Opts::new("background_jobs_active", "Background jobs currently executing"),
            &["job_type"],
        )?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "background_job_duration_seconds",
                "Background job execution duration in seconds",
            )
            .buckets(exponential_buckets(0.001, 2.0, 15)?),
            &["job_type", "status"],
        )?;

        let app_info = IntGaugeVec::new(
            Opts::new("app_info", "Application build information"),
            &["version", "environment"],
        )?;
        app_info.with_label_values(&[version, environment]).set(1);

        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(background_jobs.clone()))?;
        registry.register(Box::new(background_jobs_active.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(app_info))?;

        Ok(Self {
            registry,
            environment: environment.to_string(),
            http_request_duration,
            background_jobs,
            background_jobs_active,
            job_duration,
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one finished request. `route` must be the matched route pattern.
    pub fn observe_http(&self, method: &str, route: &str, status: u16, duration_secs: f64) {
        let status = status.to_string();
        self.http_request_duration
            .with_label_values(&[method, route, status.as_str(), self.environment.as_str()])
            .observe(duration_secs);
    }

    /// Count a job lifecycle event.
    pub fn increment_job(&self, job_type: &str, event: JobLifecycleEvent) {
        self.background_jobs
            .with_label_values(&[job_type, event.as_str()])
            .inc();
    }

    /// Raise `background_jobs_active` until the returned guard drops.
    pub fn job_active(&self, job_type: &str) -> ActiveJobGuard {
        let gauge = self.background_jobs_active.with_label_values(&[job_type]);
        gauge.inc();
        ActiveJobGuard { gauge }
    }

    /// Current value of `background_jobs_active{job_type}`.
    pub fn active_jobs(&self, job_type: &str) -> i64 {
        self.background_jobs_active
            .get_metric_with_label_values(&[job_type])
            .map(|g| g.get())
            .unwrap_or_default()
    }

    pub fn observe_job_duration(&self, job_type: &str, status: &str, duration_secs: f64) {
        self.job_duration
            .with_label_values(&[job_type, status])
            .observe(duration_secs);
    }

    /// Current value of `background_jobs_total{job_type,status}`.
    pub fn job_count(&self, job_type: &str, event: JobLifecycleEvent) -> u64 {
        self.background_jobs
            .get_metric_with_label_values(&[job_type, event.as_str()])
            .map(|c| c.get())
            .unwrap_or_default()
    }

    /// Number of observations recorded for one request series.
    pub fn http_sample_count(&self, method: &str, route: &str, status: u16) -> u64 {
        let status = status.to_string();
        self.http_request_duration
            .get_metric_with_label_values(&[method, route, status.as_str(), self.environment.as_str()])
            .map(|h| h.get_sample_count())
            .unwrap_or_default()
    }

    /// Render every series in the text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(Into::into)
    }
}
