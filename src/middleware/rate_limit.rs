//! Rate limiting middleware
//!
//! Token bucket per client token. Limiters live in a moka cache so idle
//! clients are evicted.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use moka::future::Cache;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::error::ApiError;
use crate::middleware::auth::ClientIdentity;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
pub struct RateLimitState {
    pub config: RateLimitConfig,
    /// Keyed by client fingerprint
    pub limiters: Cache<String, Arc<DirectRateLimiter>>,
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        let limiters = Cache::builder()
            .max_capacity(10_000)
            .time_to_idle(Duration::from_secs(600))
            .build();

        Self { config, limiters }
    }

    pub async fn limiter_for(&self, identity: &ClientIdentity) -> Arc<DirectRateLimiter> {
        let quota = self.quota();
        self.limiters
            .get_with(identity.fingerprint.clone(), async move {
                Arc::new(RateLimiter::direct(quota))
            })
            .await
    }

    /// Full window as burst, replenished evenly across the window
    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.config.requests_per_window).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(self.config.window_seconds.max(1));
        Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst)
    }
}

/// Reject clients over their quota with 429
///
/// Runs after the client auth middleware. Requests without a
/// `ClientIdentity` and master-key requests are not limited.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.config.enabled {
        return Ok(next.run(request).await);
    }

    let Some(identity) = request.extensions().get::<ClientIdentity>().cloned() else {
        tracing::warn!("Rate limit middleware: no ClientIdentity in extensions");
        return Ok(next.run(request).await);
    };

    if identity.bypass_rate_limit() {
        return Ok(next.run(request).await);
    }

    let limiter = state.limiter_for(&identity).await;
    match limiter.check() {
        Ok(()) => {
            let mut response = next.run(request).await;
            response.headers_mut().insert(
                "x-ratelimit-limit",
                HeaderValue::from(state.config.requests_per_window),
            );
            Ok(response)
        }
        Err(not_until) => {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let retry_after_seconds = wait.as_secs().max(1);

            tracing::warn!(
                client = %identity.label,
                retry_after_seconds,
                "Client rate limit exceeded"
            );
            Err(ApiError::RateLimitExceeded {
                retry_after_seconds,
            })
        }
    }
}
