//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::{ForwardError, NonRetryable, PoolError, UpstreamResponse};

/// Status used when the client went away before the upstream answered
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_seconds: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No upstream credential available")]
    NoAvailableUpstream,

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answer relayed to the client as-is
    #[error("Upstream returned {}", .0.status)]
    Upstream(UpstreamResponse),

    #[error("Client closed request")]
    ClientClosed,

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolExhausted => ApiError::NoAvailableUpstream,
            PoolError::UnknownCredential(id) => {
                ApiError::NotFound(format!("Credential {id} not found"))
            }
            PoolError::EmptySecret => ApiError::InvalidRequest(err.to_string()),
            PoolError::InvalidStatus { .. } | PoolError::Store(_) => {
                ApiError::Internal(anyhow::Error::new(err))
            }
        }
    }
}

impl From<ForwardError> for ApiError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::NoAvailableUpstream => ApiError::NoAvailableUpstream,
            ForwardError::UpstreamUnavailable { .. } => {
                ApiError::UpstreamUnavailable(err.to_string())
            }
            ForwardError::NonRetryableUpstream(NonRetryable::Response(response)) => {
                ApiError::Upstream(response)
            }
            ForwardError::NonRetryableUpstream(NonRetryable::Upstream(upstream)) => {
                ApiError::UpstreamUnavailable(upstream.to_string())
            }
            ForwardError::Cancelled => ApiError::ClientClosed,
            ForwardError::Pool(pool) => pool.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "authentication_error", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "permission_error", msg),
            ApiError::RateLimitExceeded {
                retry_after_seconds,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorResponse::new(
                        "rate_limit_error",
                        format!(
                            "Rate limit exceeded. Please retry after {retry_after_seconds} seconds."
                        ),
                    )),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert("retry-after", retry_after_seconds.into());
                headers.insert("x-ratelimit-reset", retry_after_seconds.into());
                return response;
            }
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found_error", msg),
            ApiError::NoAvailableUpstream => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                "No upstream credential is currently available".to_string(),
            ),
            ApiError::UpstreamUnavailable(msg) => (StatusCode::BAD_GATEWAY, "api_error", msg),
            ApiError::Upstream(response) => return response.into_response(),
            ApiError::ClientClosed => (
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST),
                "request_cancelled",
                "Client closed request".to_string(),
            ),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error", err.to_string())
            }
        };

        (status, Json(ErrorResponse::new(error_type, message))).into_response()
    }
}

/// JSON error envelope shared by handlers and middleware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub type_: String,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: "error".to_string(),
            error: ErrorDetail {
                type_: error_type.into(),
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{AttemptFailure, CredentialId, UpstreamError};
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = ApiError::InvalidRequest("secret too short".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "secret too short");
    }

    #[test]
    fn test_forward_error_status_mapping() {
        let exhausted: ApiError = ForwardError::NoAvailableUpstream.into();
        assert_eq!(exhausted.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let unavailable: ApiError = ForwardError::UpstreamUnavailable {
            attempts: 3,
            last_error: AttemptFailure::Status(StatusCode::UNAUTHORIZED),
        }
        .into();
        assert_eq!(unavailable.into_response().status(), StatusCode::BAD_GATEWAY);

        let transport: ApiError =
            ForwardError::NonRetryableUpstream(NonRetryable::Upstream(UpstreamError::Malformed(
                "bad header".into(),
            )))
            .into();
        assert_eq!(transport.into_response().status(), StatusCode::BAD_GATEWAY);

        let cancelled: ApiError = ForwardError::Cancelled.into();
        assert_eq!(cancelled.into_response().status().as_u16(), 499);
    }

    #[tokio::test]
    async fn test_non_retryable_response_passes_through() {
        let upstream = UpstreamResponse::new(StatusCode::UNPROCESSABLE_ENTITY)
            .with_body(r#"{"error":"bad model"}"#);
        let err: ApiError = ForwardError::NonRetryableUpstream(NonRetryable::Response(upstream)).into();

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "bad model");
    }

    #[test]
    fn test_pool_error_mapping() {
        let id = CredentialId::from_secret("sk-or-unknown-credential-0001");
        let missing: ApiError = PoolError::UnknownCredential(id).into();
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let empty: ApiError = PoolError::EmptySecret.into();
        assert_eq!(empty.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rate_limit_headers() {
        let response = ApiError::RateLimitExceeded {
            retry_after_seconds: 30,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "30");
    }
}
