//! Application routing

use axum::{
    http::HeaderName,
    middleware,
    routing::{any, delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{admin, health, proxy};
use crate::middleware::{
    auth::{require_client_key, require_master_key, AuthState},
    logging::log_request,
    rate_limit::{rate_limit, RateLimitState},
};
use crate::server::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/liveness", get(health::liveness));

    let auth_state = AuthState::new(state.settings.clone());
    let rate_limit_state = RateLimitState::new(state.settings.rate_limit.clone());

    // Last added layer runs first: auth, then rate limiting
    let forward_routes = Router::new()
        .route("/v1/*path", any(proxy::forward))
        .layer(middleware::from_fn_with_state(rate_limit_state, rate_limit))
        .layer(middleware::from_fn_with_state(auth_state.clone(), require_client_key));

    let admin_routes = Router::new()
        .route(
            "/credentials",
            get(admin::list_credentials).post(admin::register_credential),
        )
        .route("/credentials/:id", delete(admin::remove_credential))
        .route("/credentials/:id/disable", post(admin::disable_credential))
        .route("/credentials/:id/enable", post(admin::enable_credential))
        .route("/credentials/:id/reset", post(admin::reset_credential))
        .route("/pool/health", get(admin::pool_health))
        .layer(middleware::from_fn_with_state(auth_state, require_master_key));

    Router::new()
        .merge(forward_routes)
        .nest("/admin", admin_routes)
        .merge(health_routes)
        .layer(create_cors_layer())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderName::from_static("retry-after"),
        ])
}
