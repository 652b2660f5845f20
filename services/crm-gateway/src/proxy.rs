//! CRM passthrough
//!
//! `ANY /crm/{*path}` resolves a credential for the inbound request, builds
//! the downstream URL with it and forwards method, body and content type to
//! the CRM. The assertion itself never travels downstream. Each request is
//! attempted once; upstream failures are reported, not retried.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::Query;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use crm_auth::{AssertionTransport, InboundRequest, SHARED_TOKEN_QUERY_PARAM};
use crm_resolver::{AuthResolver, build_request};
use tracing::{debug, error, instrument, warn};

use crate::metrics::{record_request, record_upstream_error};

/// Headers to strip from upstream responses (hop-by-hop per RFC 2616 Section 13.5.1)
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

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub resolver: AuthResolver,
    pub transport: AssertionTransport,
    pub timeout: Duration,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Resolve, build and forward one request to the CRM API.
///
/// `path` is relative to the CRM API base (`deals/42`).
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %path))]
pub async fn proxy_request(
    state: &ProxyState,
    path: &str,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let response = forward(state, path, request, &request_id).await;
    record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(state: &ProxyState, path: &str, request: Request<Body>, request_id: &str) -> Response {
    let (parts, body) = request.into_parts();

    let query = match Query::<Vec<(String, String)>>::try_from_uri(&parts.uri) {
        Ok(Query(pairs)) => pairs,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid query string: {e}"),
                request_id,
            );
        }
    };

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let mut json_body = is_json(&parts.headers)
        .then(|| serde_json::from_slice::<serde_json::Value>(&body_bytes).ok())
        .flatten();

    let inbound = InboundRequest::new(
        parts.headers.clone(),
        query.iter().cloned().collect::<HashMap<_, _>>(),
        json_body.clone(),
    );

    let context = match state.resolver.resolve(&inbound).await {
        Ok(context) => context,
        Err(crm_resolver::Error::Unauthenticated) => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "no usable CRM credential for this request",
                request_id,
            );
        }
        Err(crm_resolver::Error::Configuration(msg)) => {
            error!(error = %msg, "credential resolution misconfigured");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                "gateway is not configured to refresh CRM credentials",
                request_id,
            );
        }
        Err(e) => {
            warn!(error = %e, "credential resolution failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "authentication_error",
                &e.to_string(),
                request_id,
            );
        }
    };

    let mut prepared = match build_request(&context, path) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!(error = %e, "failed to build CRM request");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                &e.to_string(),
                request_id,
            );
        }
    };
    debug!(mode = context.mode().label(), url = %prepared.redacted_url(), "forwarding to CRM");

    // The assertion is for this gateway only, and the CRM credential is the
    // one the resolver chose.
    let forwarded_query: Vec<_> = query
        .iter()
        .filter(|(name, _)| {
            *name != state.transport.query_param && name != SHARED_TOKEN_QUERY_PARAM
        })
        .collect();
    if !forwarded_query.is_empty() {
        prepared.url.query_pairs_mut().extend_pairs(forwarded_query);
    }

    let stripped = match json_body.as_mut() {
        Some(serde_json::Value::Object(map)) => map.remove(&state.transport.body_field).is_some(),
        _ => false,
    };
    let outbound_body: Bytes = match json_body {
        Some(value) if stripped => value.to_string().into(),
        _ => body_bytes,
    };

    let mut builder = prepared
        .into_builder(&state.client, parts.method.clone())
        .timeout(state.timeout)
        .body(outbound_body);
    // Inbound credentials stay here; only content negotiation is passed on.
    for name in [header::CONTENT_TYPE, header::ACCEPT] {
        if let Some(value) = parts.headers.get(&name) {
            builder = builder.header(&name, value);
        }
    }

    let upstream = match builder.send().await {
        Ok(upstream) => upstream,
        Err(e) if e.is_timeout() => {
            record_upstream_error("timeout");
            error!(error = %e, "CRM request timed out");
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "proxy_error",
                &format!("CRM timeout after {}s", state.timeout.as_secs()),
                request_id,
            );
        }
        Err(e) => {
            record_upstream_error("connection");
            error!(error = %e, "CRM request failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                "CRM request failed",
                request_id,
            );
        }
    };

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            record_upstream_error("body");
            error!(error = %e, "failed to read CRM response body");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                "CRM response read error",
                request_id,
            );
        }
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) && *name != header::CONTENT_LENGTH {
            response = response.header(name, value);
        }
    }
    response.body(Body::from(body)).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            &format!("response build error: {e}"),
            request_id,
        )
    })
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"))
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
