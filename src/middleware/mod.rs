//! Middleware module
//!
//! Client and admin authentication, per-client rate limiting and request
//! logging.

pub mod auth;
pub mod logging;
pub mod rate_limit;

pub use auth::{require_client_key, require_master_key, AuthState, ClientIdentity};
pub use logging::{log_request, RequestId, REQUEST_ID_HEADER};
pub use rate_limit::{rate_limit, RateLimitState};
