//! Request correlation middleware.

use std::any::Any;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::correlation::{self, REQUEST_ID_HEADER};
use crate::error::error_response;
use crate::propagation::{TraceCarrier, TRACEPARENT_HEADER, TRACESTATE_HEADER};
use crate::runtime::executor::panic_message;
use crate::telemetry::Telemetry;

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Give the request its id, run it inside that correlation scope and record
/// the outcome.
///
/// The request guard lives inside the scoped future, so a client that
/// disconnects mid-request still gets its metrics and completion log.
pub async fn correlate(State(telemetry): State<Telemetry>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = header_str(request.headers(), USER_AGENT.as_str())
        .unwrap_or("unknown")
        .to_string();

    let inbound = inbound_carrier(request.headers());
    let guard = telemetry.begin_request(&method, &route, &path, inbound.as_ref());
    let ctx = guard.context();

    correlation::scope(ctx.clone(), async move {
        tracing::info!(
            http.method = %method,
            http.path = %path,
            client_ip = %client_ip,
            user_agent = %user_agent,
            "Request started: {method} {path}"
        );

        let mut response = next.run(request).await;

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id().to_string()) {
            headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
        if let Some(trace) = ctx.trace() {
            if let Ok(value) = HeaderValue::from_str(&trace.traceparent()) {
                headers.insert(HeaderName::from_static(TRACEPARENT_HEADER), value);
            }
        }

        guard.finish(response.status().as_u16());
        response
    })
    .await
}

/// Response for a panicking handler. Runs inside the request's scope.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic_message(err.as_ref());
    tracing::error!(panic = %message, "Handler panicked");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn inbound_carrier(headers: &HeaderMap) -> Option<TraceCarrier> {
    let traceparent = header_str(headers, TRACEPARENT_HEADER)?;
    Some(TraceCarrier {
        traceparent: Some(traceparent.to_string()),
        tracestate: header_str(headers, TRACESTATE_HEADER).map(str::to_string),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_carrier_requires_traceparent() {
        let mut headers = HeaderMap::new();
        assert!(inbound_carrier(&headers).is_none());

        headers.insert(TRACESTATE_HEADER, HeaderValue::from_static("vendor=1"));
        assert!(inbound_carrier(&headers).is_none());

        headers.insert(
            TRACEPARENT_HEADER,
            HeaderValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
        );
        let carrier = inbound_carrier(&headers).unwrap();
        assert_eq!(carrier.tracestate.as_deref(), Some("vendor=1"));
    }
}
