//! Credential Gateway library
//!
//! A pool of upstream credentials with per-credential circuit breakers, a
//! background rotation monitor, and a forwarding engine that retries across
//! credentials. The HTTP surface (`server`, `api`, `middleware`) is a thin
//! layer over `services`.

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod server;
pub mod services;
pub mod utils;

pub use config::Settings;
pub use error::ApiError;
pub use server::App;
pub use services::{CredentialPool, ForwardingEngine, RotationMonitor};
