//! Utility modules
//!
//! Contains backoff calculation and timeout handling.

pub mod backoff;
pub mod timeout;

pub use backoff::Backoff;
pub use timeout::{with_timeout, TimeoutError};
