//! HTTP-facing error types

mod types;

pub use types::{ApiError, ErrorDetail, ErrorResponse};
