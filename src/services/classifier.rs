//! Failure classification
//!
//! Maps upstream results onto pool outcomes. The state machine never looks at
//! status codes; this table is the only place that does, and it is loaded
//! from configuration so it can be tuned per upstream API.

use crate::services::credential_pool::Outcome;
use crate::services::forwarder::UpstreamError;
use std::collections::BTreeSet;

/// How an upstream result affects the request and the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Counts towards pool health; `Outcome::Success` ends the request
    Report(Outcome),
    /// Surface to the caller unchanged, no report, no retry
    NonRetryable,
}

/// Status-code tables for credential and transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationPolicy {
    pub credential_error_statuses: BTreeSet<u16>,
    pub transient_error_statuses: BTreeSet<u16>,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            credential_error_statuses: [401, 402, 403, 429].into_iter().collect(),
            transient_error_statuses: [500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl ClassificationPolicy {
    pub fn new(
        credential_error_statuses: impl IntoIterator<Item = u16>,
        transient_error_statuses: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            credential_error_statuses: credential_error_statuses.into_iter().collect(),
            transient_error_statuses: transient_error_statuses.into_iter().collect(),
        }
    }

    /// Classify a completed upstream response by status code
    pub fn classify_status(&self, status: u16) -> Classification {
        if self.credential_error_statuses.contains(&status) {
            Classification::Report(Outcome::CredentialError)
        } else if self.transient_error_statuses.contains(&status) {
            Classification::Report(Outcome::TransientError)
        } else if status < 400 {
            Classification::Report(Outcome::Success)
        } else {
            Classification::NonRetryable
        }
    }

    /// Classify a request that produced no usable response
    pub fn classify_error(&self, error: &UpstreamError) -> Classification {
        match error {
            UpstreamError::Timeout(_) | UpstreamError::Connect(_) | UpstreamError::Transport(_) => {
                Classification::Report(Outcome::TransientError)
            }
            UpstreamError::Malformed(_) => Classification::NonRetryable,
        }
    }
}
