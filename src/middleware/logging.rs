//! Request logging middleware
//!
//! Assigns or propagates `x-request-id`, runs the request inside an
//! `http_request` span, and logs completion by status class.

use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::fmt;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id, stored in request extensions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reuse the caller's id when it is a sane header value
    fn from_request(request: &Request) -> Self {
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .map(|id| Self(id.to_string()))
            .unwrap_or_default()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub async fn log_request(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = RequestId::from_request(&request);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    span.in_scope(|| tracing::debug!(user_agent = %user_agent, "Incoming request"));

    request.extensions_mut().insert(request_id.clone());
    let mut response = next.run(request).instrument(span.clone()).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    span.in_scope(|| {
        if response.status().is_server_error() {
            tracing::error!(status, duration_ms, "Server error");
        } else if response.status().is_client_error() {
            tracing::warn!(status, duration_ms, "Client error");
        } else {
            tracing::info!(status, duration_ms, "Request completed");
        }
    });

    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
