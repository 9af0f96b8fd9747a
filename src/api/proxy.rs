//! Forwarding endpoint
//!
//! `ANY /v1/*path` is replayed against the upstream API with a pooled
//! credential. Client auth headers never reach the upstream, and the
//! upstream body is relayed chunk by chunk as it arrives.

use axum::{
    body::{Body, Bytes},
    extract::{OriginalUri, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::server::state::AppState;
use crate::services::{UpstreamBody, UpstreamRequest, UpstreamResponse};

/// Connection-scoped headers, never relayed in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client credentials and framing headers the gateway recomputes
const CLIENT_ONLY: &[&str] = &["authorization", "x-api-key", "host", "content-length"];

/// ANY /v1/*path
///
/// Forwards the request with the best available credential, retrying on
/// credential and transport failures. Non-retryable upstream answers are
/// relayed unchanged.
pub async fn forward(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let mut request = UpstreamRequest::new(method, path_and_query).with_body(body);
    request.headers = strip_headers(&headers, CLIENT_ONLY);

    let response = state.forwarder.forward(request).await?;
    Ok(response.into_response())
}

fn strip_headers(headers: &HeaderMap, extra: &[&str]) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP.iter().chain(extra) {
        out.remove(*name);
    }
    out
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            UpstreamBody::Full(bytes) => Body::from(bytes),
            UpstreamBody::Stream(stream) => Body::from_stream(stream),
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = strip_headers(&self.headers, &["content-length"]);
        response
    }
}
