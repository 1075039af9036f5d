//! Per-request correlation state.
//!
//! A [`RequestContext`] is created once per inbound request (or per job
//! execution) and installed as a tokio task-local. Everything emitted while
//! the context is in scope, log lines in particular, picks it up through
//! [`current`] without it being threaded through call signatures.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::TaskId;
use crate::propagation::TraceCarrier;

/// Response header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static CURRENT_CONTEXT: Arc<RequestContext>;
}

/// Random (v4) identifier for one request. Never sequential.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifiers of the span that was started for this unit of work.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TraceIds {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// 16 lowercase hex characters.
    pub span_id: String,
    pub sampled: bool,
}

impl TraceIds {
    /// W3C `traceparent` value for these ids.
    pub fn traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }
}

/// Extra identity carried by contexts that belong to a background job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobScope {
    pub task_id: TaskId,
    pub job_type: String,
    pub attempt: u32,
}

/// Correlation state for one request or job execution.
///
/// Identity fields never change after construction; elapsed time is
/// computed when something asks for it.
#[derive(Clone)]
pub struct RequestContext {
    request_id: RequestId,
    trace: Option<TraceIds>,
    carrier: Option<TraceCarrier>,
    job: Option<JobScope>,
    started_at: Instant,
}

impl RequestContext {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            trace: None,
            carrier: None,
            job: None,
            started_at: Instant::now(),
        }
    }

    /// Attach the ids and outbound carrier of the span started for this context.
    pub fn with_trace(mut self, trace: TraceIds, carrier: TraceCarrier) -> Self {
        self.trace = Some(trace);
        self.carrier = Some(carrier);
        self
    }

    pub fn with_job(mut self, job: JobScope) -> Self {
        self.job = Some(job);
        self
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn trace(&self) -> Option<&TraceIds> {
        self.trace.as_ref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace.as_ref().map(|t| t.trace_id.as_str())
    }

    pub fn span_id(&self) -> Option<&str> {
        self.trace.as_ref().map(|t| t.span_id.as_str())
    }

    /// Carrier to embed in outbound work so it continues this trace.
    pub fn carrier(&self) -> Option<&TraceCarrier> {
        self.carrier.as_ref()
    }

    pub fn job(&self) -> Option<&JobScope> {
        self.job.as_ref()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("trace", &self.trace)
            .field("job", &self.job)
            .field("elapsed_ms", &self.elapsed_ms())
            .finish()
    }
}

/// The context installed for the running task, if any.
pub fn current() -> Option<Arc<RequestContext>> {
    CURRENT_CONTEXT.try_with(Arc::clone).ok()
}

/// Run `fut` with `ctx` installed as the current context.
pub async fn scope<F>(ctx: Arc<RequestContext>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// Synchronous counterpart of [`scope`], used from drop guards.
pub fn sync_scope<R>(ctx: Arc<RequestContext>, f: impl FnOnce() -> R) -> R {
    CURRENT_CONTEXT.sync_scope(ctx, f)
}
