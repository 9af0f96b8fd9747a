//! Forwarding Engine
//!
//! Ties credential selection to outcome reporting for one inbound request:
//! select, call upstream under a per-attempt timeout, classify, report, and
//! retry on a different credential for credential or transport failures.
//!
//! The attempt timeout bounds the response head only. Once the status is
//! classified the attempt is settled and the body is handed back as a stream.

use crate::services::classifier::{Classification, ClassificationPolicy};
use crate::services::credential_pool::{CredentialId, CredentialPool, Lease, Outcome, PoolError};
use crate::utils::{with_timeout, Backoff};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use futures::stream::{Stream, StreamExt};
use secrecy::SecretString;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Upstream Types
// ============================================================================

/// Request to replay against the upstream API
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path plus query, appended to the upstream base URL
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Body chunks in arrival order; an `Err` ends the stream
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Upstream response body, either buffered or still arriving
pub enum UpstreamBody {
    Full(Bytes),
    Stream(BodyStream),
}

impl UpstreamBody {
    /// Read the whole body into memory
    pub async fn into_bytes(self) -> Result<Bytes, UpstreamError> {
        match self {
            Self::Full(bytes) => Ok(bytes),
            Self::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl Default for UpstreamBody {
    fn default() -> Self {
        Self::Full(Bytes::new())
    }
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Raw upstream response
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: UpstreamBody::default(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = UpstreamBody::Full(body.into());
        self
    }

    pub fn with_stream(mut self, stream: BodyStream) -> Self {
        self.body = UpstreamBody::Stream(stream);
        self
    }
}

/// Failure to obtain a usable upstream response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("malformed upstream exchange: {0}")]
    Malformed(String),
}

/// Client able to send one request with one credential secret
///
/// `send` resolves once the response head is in; the body may still be
/// streaming when it returns.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(
        &self,
        request: &UpstreamRequest,
        secret: &SecretString,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Last failed attempt, kept for diagnostics
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    /// Upstream answered with a credential or transient failure status
    Status(StatusCode),
    Upstream(UpstreamError),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "upstream returned {status}"),
            Self::Upstream(err) => err.fmt(f),
        }
    }
}

/// Upstream result passed back to the caller untouched
#[derive(Debug)]
pub enum NonRetryable {
    Response(UpstreamResponse),
    Upstream(UpstreamError),
}

impl fmt::Display for NonRetryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(response) => write!(f, "upstream returned {}", response.status),
            Self::Upstream(err) => err.fmt(f),
        }
    }
}

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("No upstream credential available")]
    NoAvailableUpstream,

    #[error("Upstream unavailable after {attempts} attempt(s): {last_error}")]
    UpstreamUnavailable { attempts: u32, last_error: AttemptFailure },

    #[error("Non-retryable upstream failure: {0}")]
    NonRetryableUpstream(NonRetryable),

    #[error("Request cancelled by client")]
    Cancelled,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ============================================================================
// Forwarding Engine
// ============================================================================

/// Retry and timeout settings for forwarding
#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    /// Pause between attempts; a zero base disables it
    pub retry_backoff: Backoff,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(30),
            retry_backoff: Backoff::new(Duration::ZERO, Duration::from_secs(2)),
        }
    }
}

pub struct ForwardingEngine {
    pool: Arc<CredentialPool>,
    client: Arc<dyn UpstreamClient>,
    classifier: ClassificationPolicy,
    config: ForwarderConfig,
}

impl ForwardingEngine {
    pub fn new(
        pool: Arc<CredentialPool>,
        client: Arc<dyn UpstreamClient>,
        classifier: ClassificationPolicy,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            pool,
            client,
            classifier,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ForwardError> {
        self.forward_with_cancel(request, &CancellationToken::new()).await
    }

    /// Forward `request`, aborting the in-flight attempt when `cancel` fires
    ///
    /// Reports already made for earlier attempts stand; the aborted attempt
    /// is not reported and its lease is released.
    pub async fn forward_with_cancel(
        &self,
        request: UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse, ForwardError> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut tried: Vec<CredentialId> = Vec::new();
        let mut attempts: u32 = 0;
        let mut last_error: Option<AttemptFailure> = None;

        while attempts < max_attempts {
            if attempts > 0 && !self.config.retry_backoff.is_zero() {
                let pause = self.config.retry_backoff.delay_for(attempts - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(ForwardError::Cancelled);
            }

            let lease = match self.pool.select_excluding(&tried) {
                Ok(lease) => lease,
                Err(PoolError::PoolExhausted) => break,
                Err(e) => return Err(e.into()),
            };
            tried.push(lease.id().clone());

            let secret = match self.pool.secret_for(lease.id()).await {
                Ok(secret) => secret,
                Err(PoolError::UnknownCredential(id)) => {
                    tracing::warn!(credential = %id.short(), "Selected credential was removed before use");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            attempts += 1;
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(credential = %lease.id().short(), attempt = attempts, "Upstream attempt cancelled");
                    return Err(ForwardError::Cancelled);
                }
                result = with_timeout(self.config.attempt_timeout, self.client.send(&request, &secret)) => {
                    result.map_err(|e| e.flatten(UpstreamError::Timeout))
                }
            };
            drop(secret);
            // Time to the response head; the body is not awaited here
            let duration_ms = started.elapsed().as_millis() as u64;

            let classification = match &result {
                Ok(response) => self.classifier.classify_status(response.status.as_u16()),
                Err(err) => self.classifier.classify_error(err),
            };

            let outcome = match classification {
                Classification::Report(outcome) => outcome,
                Classification::NonRetryable => {
                    tracing::info!(
                        credential = %lease.id().short(),
                        attempt = attempts,
                        duration_ms,
                        "Non-retryable upstream result passed through"
                    );
                    drop(lease);
                    return Err(ForwardError::NonRetryableUpstream(match result {
                        Ok(response) => NonRetryable::Response(response),
                        Err(err) => NonRetryable::Upstream(err),
                    }));
                }
            };

            let credential = lease.id().clone();
            self.settle(lease, outcome);

            match result {
                Ok(response) if outcome == Outcome::Success => {
                    tracing::debug!(
                        credential = %credential.short(),
                        attempt = attempts,
                        status = response.status.as_u16(),
                        duration_ms,
                        "Upstream attempt succeeded"
                    );
                    return Ok(response);
                }
                Ok(response) => last_error = Some(AttemptFailure::Status(response.status)),
                Err(err) => last_error = Some(AttemptFailure::Upstream(err)),
            }

            tracing::warn!(
                credential = %credential.short(),
                attempt = attempts,
                max_attempts,
                %outcome,
                duration_ms,
                error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "Upstream attempt failed"
            );
        }

        match last_error {
            None => Err(ForwardError::NoAvailableUpstream),
            Some(last_error) => Err(ForwardError::UpstreamUnavailable { attempts, last_error }),
        }
    }

    fn settle(&self, lease: Lease, outcome: Outcome) {
        let id = lease.id().clone();
        if let Err(e) = self.pool.settle(lease, outcome) {
            tracing::warn!(credential = %id.short(), %outcome, error = %e, "Failed to report attempt outcome");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
