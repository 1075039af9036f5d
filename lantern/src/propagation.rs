//! Feature-flagged distributed tracing.
//!
//! [`TracePropagator`] has two implementations selected once at startup:
//! [`NoopPropagator`] when tracing is disabled (no spans, no headers) and
//! [`OtelPropagator`], which starts OpenTelemetry spans, exports them over
//! OTLP/HTTP through a batch processor and speaks W3C trace context.

use std::collections::HashMap;
use std::fmt;

use anyhow::anyhow;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{
    Span as _, SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};

use crate::config::OtelConfig;
use crate::correlation::TraceIds;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

const TRACER_NAME: &str = "lantern";

/// Serialized trace context that travels with outbound work.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TraceCarrier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

impl TraceCarrier {
    pub fn from_traceparent(traceparent: impl Into<String>) -> Self {
        Self {
            traceparent: Some(traceparent.into()),
            tracestate: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.traceparent.is_none()
    }

    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(tp) = &self.traceparent {
            map.insert(TRACEPARENT_HEADER.to_string(), tp.clone());
        }
        if let Some(ts) = &self.tracestate {
            map.insert(TRACESTATE_HEADER.to_string(), ts.clone());
        }
        map
    }

    fn from_map(mut map: HashMap<String, String>) -> Self {
        Self {
            traceparent: map.remove(TRACEPARENT_HEADER),
            tracestate: map
                .remove(TRACESTATE_HEADER)
                .filter(|s| !s.is_empty()),
        }
    }
}

/// What a span represents, mapped onto the OpenTelemetry span kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpanRole {
    /// Inbound HTTP request.
    Server,
    /// Background job picked up from the broker.
    Consumer,
}

/// How a span finished.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpanOutcome {
    Ok,
    Error(String),
}

/// A span that has been started and not yet ended.
pub struct ActiveSpan {
    ids: TraceIds,
    cx: Context,
}

impl ActiveSpan {
    pub fn ids(&self) -> &TraceIds {
        &self.ids
    }

    pub fn set_attribute(&self, key: &'static str, value: impl Into<opentelemetry::Value>) {
        self.cx.span().set_attribute(KeyValue::new(key, value));
    }

    pub fn end(self, outcome: SpanOutcome) {
        let span = self.cx.span();
        match outcome {
            SpanOutcome::Ok => span.set_status(Status::Ok),
            SpanOutcome::Error(message) => span.set_status(Status::error(message)),
        }
        span.end();
    }
}

impl fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSpan").field("ids", &self.ids).finish()
    }
}

/// Parent extracted from an inbound carrier.
pub struct RemoteParent {
    ids: TraceIds,
    cx: Context,
}

impl RemoteParent {
    pub fn ids(&self) -> &TraceIds {
        &self.ids
    }
}

impl fmt::Debug for RemoteParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteParent").field("ids", &self.ids).finish()
    }
}

/// Starts spans and moves trace context across process boundaries.
///
/// None of these operations fail: a propagator that cannot do its job
/// returns `None` and the caller carries on without trace fields.
pub trait TracePropagator: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Start a span, continuing `parent` when one is given.
    fn start_span(
        &self,
        name: &str,
        role: SpanRole,
        parent: Option<&RemoteParent>,
    ) -> Option<ActiveSpan>;

    /// Serialize the span's context into a carrier.
    fn inject(&self, span: &ActiveSpan) -> TraceCarrier {
        TraceCarrier::from_traceparent(span.ids().traceparent())
    }

    /// Parse a carrier. Missing or malformed carriers yield `None`.
    fn extract(&self, carrier: &TraceCarrier) -> Option<RemoteParent>;

    /// Flush buffered spans. Called once during graceful shutdown.
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Tracing disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPropagator;

impl TracePropagator for NoopPropagator {
    fn is_enabled(&self) -> bool {
        false
    }

    fn start_span(&self, _: &str, _: SpanRole, _: Option<&RemoteParent>) -> Option<ActiveSpan> {
        None
    }

    fn extract(&self, _: &TraceCarrier) -> Option<RemoteParent> {
        None
    }
}

/// OpenTelemetry-backed propagator exporting over OTLP/HTTP.
pub struct OtelPropagator {
    provider: SdkTracerProvider,
    propagator: TraceContextPropagator,
    traces_url: String,
}

impl fmt::Debug for OtelPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelPropagator")
            .field("traces_url", &self.traces_url)
            .finish()
    }
}

impl OtelPropagator {
    /// Build the exporter and tracer provider.
    ///
    /// Exports happen on the batch processor's own thread, so an unreachable
    /// collector only ever costs dropped spans.
    pub fn new(config: &OtelConfig, environment: &str) -> anyhow::Result<Self> {
        let traces_url = config.traces_url();
        let endpoint = traces_url.clone();
        let timeout = config.export_timeout;

        // The blocking HTTP client must not be constructed on an async worker thread.
        let exporter = std::thread::spawn(move || {
            opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint)
                .with_timeout(timeout)
                .build()
                .map_err(|e| anyhow!("failed to build OTLP span exporter: {e}"))
        })
        .join()
        .map_err(|_| anyhow!("OTLP exporter construction panicked"))??;

        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .with_attributes([
                KeyValue::new("deployment.environment", environment.to_string()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])
            .build();

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build();

        Ok(Self::with_provider(provider, traces_url))
    }

    /// Wrap an already configured provider.
    pub fn with_provider(provider: SdkTracerProvider, traces_url: impl Into<String>) -> Self {
        Self {
            provider,
            propagator: TraceContextPropagator::new(),
            traces_url: traces_url.into(),
        }
    }
}

fn ids_of(cx: &Context) -> Option<TraceIds> {
    let span = cx.span();
    let span_context = span.span_context();
    if !span_context.is_valid() {
        return None;
    }
    Some(TraceIds {
        trace_id: span_context.trace_id().to_string(),
        span_id: span_context.span_id().to_string(),
        sampled: span_context.trace_flags().is_sampled(),
    })
}

impl TracePropagator for OtelPropagator {
    fn is_enabled(&self) -> bool {
        true
    }

    fn start_span(
        &self,
        name: &str,
        role: SpanRole,
        parent: Option<&RemoteParent>,
    ) -> Option<ActiveSpan> {
        let tracer = self.provider.tracer(TRACER_NAME);
        let parent_cx = parent.map(|p| p.cx.clone()).unwrap_or_default();
        let kind = match role {
            SpanRole::Server => SpanKind::Server,
            SpanRole::Consumer => SpanKind::Consumer,
        };

        let span = tracer
            .span_builder(name.to_string())
            .with_kind(kind)
            .start_with_context(&tracer, &parent_cx);
        if !span.span_context().is_valid() {
            return None;
        }

        let cx = parent_cx.with_span(span);
        let ids = ids_of(&cx)?;
        Some(ActiveSpan { ids, cx })
    }

    fn inject(&self, span: &ActiveSpan) -> TraceCarrier {
        let mut map = HashMap::new();
        self.propagator.inject_context(&span.cx, &mut map);
        TraceCarrier::from_map(map)
    }

    fn extract(&self, carrier: &TraceCarrier) -> Option<RemoteParent> {
        if carrier.is_empty() {
            return None;
        }
        let cx = self.propagator.extract(&carrier.to_map());
        let ids = ids_of(&cx)?;
        Some(RemoteParent { ids, cx })
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.provider
            .shutdown()
            .map_err(|e| anyhow!("tracer provider shutdown failed: {e:?}"))
    }
}
