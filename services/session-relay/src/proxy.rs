//! API forwarding
//!
//! Receives `/api/*` requests from the dashboard frontend, strips hop-by-hop
//! and client-supplied credential headers, and forwards them through the
//! request pipeline, which attaches the session's bearer token and handles
//! refresh. Upstream responses are returned verbatim (including non-2xx);
//! failures with no upstream response become the error envelope.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use request_pipeline::RequestPipeline;
use tracing::{debug, error, instrument, warn};
use transport::{ErrorKind, HttpRequest, HttpResponse};

use crate::error::RelayError;
use crate::metrics::{self as relay_metrics, RelayStats};

/// Largest request body forwarded upstream.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers the relay owns on the outbound leg. Authorization comes from the
/// session, host and length from the transport.
const RELAY_OWNED_HEADERS: &[&str] = &["authorization", "host", "content-length"];

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_forwardable(name: &str) -> bool {
    !is_hop_by_hop(name) && !RELAY_OWNED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Forward an inbound `/api/*` request through the pipeline.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    pipeline: &RequestPipeline,
    stats: &RelayStats,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let _in_flight = stats.begin();
    let started = Instant::now();
    let method = request.method().clone();

    let response = match forward(pipeline, request, &request_id).await {
        Ok(upstream) => relay_response(upstream, &request_id),
        Err(failure) => {
            stats.record_error();
            relay_metrics::record_upstream_error(failure.error.kind.label());
            warn!(kind = %failure.error.kind, status = ?failure.error.status, error = %failure.error.message, "relay failed");
            failure.into_response()
        }
    };

    relay_metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    pipeline: &RequestPipeline,
    request: Request<Body>,
    request_id: &str,
) -> Result<HttpResponse, RelayError> {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if is_forwardable(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let method = request.method().clone();
    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to read request body");
            RelayError::local(
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation,
                format!("invalid request body: {e}"),
                request_id,
            )
        })?;

    let mut outbound = HttpRequest::new(method, path).with_body(body);
    outbound.headers.extend(headers);

    pipeline
        .forward(outbound)
        .await
        .map_err(|e| RelayError::new(e, request_id))
}

fn relay_response(upstream: HttpResponse, request_id: &str) -> Response {
    debug!(status = upstream.status, "relaying upstream response");
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) && name.as_str() != "content-length" {
            response = response.header(name, value);
        }
    }
    response.body(Body::from(upstream.body)).unwrap_or_else(|e| {
        RelayError::local(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Unknown,
            format!("response build error: {e}"),
            request_id,
        )
        .into_response()
    })
}
