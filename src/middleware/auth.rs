//! Authentication middleware
//!
//! Client tokens gate the forwarding routes; the master key gates the admin
//! routes and is also accepted as a client token.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::Settings;
use crate::error::ApiError;

// ============================================================================
// Client Identity
// ============================================================================

/// Authenticated caller, injected into request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Truncated token for logs
    pub label: String,
    /// Stable per-token key for rate limiting
    pub fingerprint: String,
    pub is_master: bool,
}

impl ClientIdentity {
    fn for_key(api_key: &str, is_master: bool) -> Self {
        Self {
            label: truncate_key(api_key),
            fingerprint: hex::encode(&Sha256::digest(api_key.as_bytes())[..8]),
            is_master,
        }
    }

    pub fn master(api_key: &str) -> Self {
        Self::for_key(api_key, true)
    }

    pub fn client(api_key: &str) -> Self {
        Self::for_key(api_key, false)
    }

    /// Placeholder identity when client auth is switched off
    pub fn anonymous() -> Self {
        Self {
            label: "anonymous".to_string(),
            fingerprint: "anonymous".to_string(),
            is_master: false,
        }
    }

    pub fn bypass_rate_limit(&self) -> bool {
        self.is_master
    }
}

/// First 8 characters plus an ellipsis
fn truncate_key(key: &str) -> String {
    if key.chars().count() > 12 {
        let prefix: String = key.chars().take(8).collect();
        format!("{prefix}...")
    } else {
        key.to_string()
    }
}

// ============================================================================
// Middleware
// ============================================================================

#[derive(Clone)]
pub struct AuthState {
    pub settings: Arc<Settings>,
}

impl AuthState {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

/// Require a configured client token (or the master key)
pub async fn require_client_key(
    State(auth): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !auth.settings.require_api_key {
        tracing::debug!("Client authentication disabled, skipping");
        request.extensions_mut().insert(ClientIdentity::anonymous());
        return Ok(next.run(request).await);
    }

    let Some(api_key) = extract_api_key(request.headers()) else {
        tracing::warn!("Request missing API key (x-api-key or Authorization: Bearer)");
        return Err(missing_key());
    };

    let identity = if auth.settings.master_api_key.as_deref() == Some(api_key.as_str()) {
        ClientIdentity::master(&api_key)
    } else if auth.settings.accepted_client_keys().any(|k| k == api_key) {
        ClientIdentity::client(&api_key)
    } else {
        tracing::warn!(key = %truncate_key(&api_key), "Invalid client API key");
        return Err(invalid_key());
    };

    tracing::debug!(key = %identity.label, master = identity.is_master, "Client authenticated");
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Require the master key; admin routes are closed when none is configured
pub async fn require_master_key(
    State(auth): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(master_key) = auth.settings.master_api_key.as_deref() else {
        return Err(ApiError::Forbidden(
            "Admin API is disabled: no master key configured".to_string(),
        ));
    };

    let Some(api_key) = extract_api_key(request.headers()) else {
        return Err(missing_key());
    };

    if api_key != master_key {
        tracing::warn!(key = %truncate_key(&api_key), "Admin request with non-master key");
        return Err(ApiError::Forbidden(
            "Admin routes require the master API key".to_string(),
        ));
    }

    request.extensions_mut().insert(ClientIdentity::master(&api_key));
    Ok(next.run(request).await)
}

fn missing_key() -> ApiError {
    ApiError::Unauthorized(
        "Missing API key. Include 'x-api-key' or 'Authorization: Bearer <key>' header in your request."
            .to_string(),
    )
}

fn invalid_key() -> ApiError {
    ApiError::Unauthorized("Invalid API key. Please check your API key and try again.".to_string())
}

/// Read `x-api-key`, falling back to `Authorization: Bearer`
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
