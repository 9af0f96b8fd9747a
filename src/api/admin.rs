//! Credential management endpoints
//!
//! Master-key protected surface for registering, inspecting and toggling
//! pooled upstream credentials.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ApiError;
use crate::server::state::AppState;
use crate::services::{CredentialId, CredentialSnapshot, PoolHealthSummary};

/// Body of `POST /admin/credentials`
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterCredentialRequest {
    #[validate(length(min = 20, message = "secret must be at least 20 characters"))]
    pub secret: String,
    /// Selection weight; the configured default when omitted
    #[validate(range(min = 1_u32, max = 1000_u32))]
    pub weight: Option<u32>,
}

/// The id derived from the secret plus the credential's current state
#[derive(Debug, Serialize)]
pub struct RegisterCredentialResponse {
    pub id: CredentialId,
    pub credential: CredentialSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ListCredentialsResponse {
    pub credentials: Vec<CredentialSnapshot>,
    pub total: usize,
}

/// List every credential
///
/// Disabled credentials are included. Secrets are never returned, only the
/// SHA-256 derived id.
///
/// GET /admin/credentials
pub async fn list_credentials(State(state): State<AppState>) -> Json<ListCredentialsResponse> {
    let credentials = state.pool.list();
    Json(ListCredentialsResponse {
        total: credentials.len(),
        credentials,
    })
}

/// Register a credential
///
/// Idempotent: posting a secret that is already pooled returns its existing
/// id and state unchanged. Answers 201 either way.
///
/// POST /admin/credentials
pub async fn register_credential(
    State(state): State<AppState>,
    Json(request): Json<RegisterCredentialRequest>,
) -> Result<(StatusCode, Json<RegisterCredentialResponse>), ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let secret = SecretString::new(request.secret.trim().into());
    let id = match request.weight {
        Some(weight) => state.pool.register_weighted(secret, weight).await?,
        None => state.pool.register(secret).await?,
    };

    let credential = snapshot_or_missing(&state, &id)?;
    Ok((StatusCode::CREATED, Json(RegisterCredentialResponse { id, credential })))
}

/// Remove a credential and its stored secret
///
/// Unknown ids are accepted, so retries are safe.
///
/// DELETE /admin/credentials/:id
pub async fn remove_credential(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&raw_id)?;
    state.pool.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Take a credential out of rotation
///
/// The credential stays registered and can be enabled again.
///
/// POST /admin/credentials/:id/disable
pub async fn disable_credential(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<CredentialSnapshot>, ApiError> {
    let id = parse_id(&raw_id)?;
    state.pool.disable(&id)?;
    snapshot_or_missing(&state, &id).map(Json)
}

/// Return a disabled credential to HEALTHY with cleared counters
///
/// POST /admin/credentials/:id/enable
pub async fn enable_credential(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<CredentialSnapshot>, ApiError> {
    let id = parse_id(&raw_id)?;
    state.pool.enable(&id)?;
    snapshot_or_missing(&state, &id).map(Json)
}

/// Close a credential's circuit without waiting for its cool-down
///
/// Disabled credentials stay disabled.
///
/// POST /admin/credentials/:id/reset
pub async fn reset_credential(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<CredentialSnapshot>, ApiError> {
    let id = parse_id(&raw_id)?;
    state.pool.reset_credential(&id)?;
    snapshot_or_missing(&state, &id).map(Json)
}

/// Per-status credential counts
///
/// GET /admin/pool/health
pub async fn pool_health(State(state): State<AppState>) -> Json<PoolHealthSummary> {
    Json(state.pool.summary())
}

fn parse_id(raw: &str) -> Result<CredentialId, ApiError> {
    CredentialId::parse(raw).ok_or_else(|| {
        ApiError::InvalidRequest("credential id must be 64 hex characters".to_string())
    })
}

/// Snapshot after a mutation; a concurrent removal surfaces as 404
fn snapshot_or_missing(state: &AppState, id: &CredentialId) -> Result<CredentialSnapshot, ApiError> {
    state
        .pool
        .snapshot(id)
        .ok_or_else(|| ApiError::NotFound(format!("Credential {id} not found")))
}
