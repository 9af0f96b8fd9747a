//! Credential model
//!
//! A credential is one pooled upstream API key. The pool only ever sees its
//! id (a SHA-256 digest of the secret) and its health bookkeeping; the raw
//! secret lives in the credential store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Credential Status
// ============================================================================

/// Circuit breaker status of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    /// Serving traffic normally
    Healthy,
    /// Repeated failures; not selectable until a trial succeeds
    Degraded,
    /// Circuit open, waiting for its cool-down
    Open,
    /// Cool-down elapsed, one trial request allowed at a time
    HalfOpen,
    /// Administratively disabled, never selected automatically
    Disabled,
}

impl CredentialStatus {
    pub const ALL: [CredentialStatus; 5] = [
        Self::Healthy,
        Self::Degraded,
        Self::Open,
        Self::HalfOpen,
        Self::Disabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
            Self::Disabled => "DISABLED",
        }
    }

    /// Statuses the pool may hand out
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::Healthy | Self::HalfOpen)
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown credential status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for CredentialStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

// ============================================================================
// Credential Id
// ============================================================================

/// Stable credential identifier: lowercase hex SHA-256 of the trimmed secret
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    const HEX_LEN: usize = 64;
    const SHORT_LEN: usize = 12;

    /// Derive the id for a raw secret
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.trim().as_bytes());
        Self(hex::encode(digest))
    }

    /// Parse an id supplied from outside (e.g. an admin path segment)
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() == Self::HEX_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used in logs
    pub fn short(&self) -> &str {
        &self.0[..Self::SHORT_LEN.min(self.0.len())]
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialId({})", self.short())
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of one forwarding attempt, as classified at the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Upstream rejected the credential itself (auth, quota, suspension)
    CredentialError,
    /// Network-level failure (timeout, connection reset)
    TransientError,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::CredentialError => "credential_error",
            Self::TransientError => "transient_error",
        })
    }
}

// ============================================================================
// Credential State
// ============================================================================

/// Mutable health state of one credential, guarded by its slot's mutex
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CredentialState {
    pub status: CredentialStatus,
    pub consecutive_failures: u32,
    pub consecutive_transient_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_selected_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub window_start: DateTime<Utc>,
    pub weight: u32,
    pub base_weight: u32,
    /// Number of cool-down doublings currently applied
    pub cooldown_level: u32,
    pub trial_in_flight: bool,
    pub trial_epoch: u64,
    pub registered_at: DateTime<Utc>,
}

impl CredentialState {
    pub fn new(weight: u32, now: DateTime<Utc>) -> Self {
        let weight = weight.max(1);
        Self {
            status: CredentialStatus::Healthy,
            consecutive_failures: 0,
            consecutive_transient_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_selected_at: None,
            opened_at: None,
            usage_count: 0,
            window_start: now,
            weight,
            base_weight: weight,
            cooldown_level: 0,
            trial_in_flight: false,
            trial_epoch: 0,
            registered_at: now,
        }
    }

    /// Most recent selection, success or failure
    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        [self.last_selected_at, self.last_success_at, self.last_failure_at]
            .into_iter()
            .flatten()
            .max()
    }

    pub fn trial_available(&self) -> bool {
        self.status == CredentialStatus::HalfOpen && !self.trial_in_flight
    }

    pub fn snapshot(&self, id: &CredentialId) -> CredentialSnapshot {
        CredentialSnapshot {
            id: id.clone(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            usage_count: self.usage_count,
            opened_at: self.opened_at,
            weight: self.weight,
            trial_in_flight: self.trial_in_flight,
        }
    }

    pub fn to_record(&self, id: &CredentialId) -> CredentialRecord {
        CredentialRecord {
            id: id.clone(),
            status: self.status.to_string(),
            consecutive_failures: self.consecutive_failures,
            consecutive_transient_failures: self.consecutive_transient_failures,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            last_selected_at: self.last_selected_at,
            opened_at: self.opened_at,
            usage_count: self.usage_count,
            window_start: self.window_start,
            weight: self.weight,
            base_weight: self.base_weight,
            cooldown_level: self.cooldown_level,
            registered_at: self.registered_at,
        }
    }

    /// Rebuild state from a persisted record; trial slots never survive a restart
    pub fn from_record(record: &CredentialRecord) -> Result<Self, UnknownStatus> {
        let status = record.status.parse::<CredentialStatus>()?;
        let base_weight = record.base_weight.max(1);
        Ok(Self {
            status,
            consecutive_failures: record.consecutive_failures,
            consecutive_transient_failures: record.consecutive_transient_failures,
            last_success_at: record.last_success_at,
            last_failure_at: record.last_failure_at,
            last_selected_at: record.last_selected_at,
            opened_at: record.opened_at,
            usage_count: record.usage_count,
            window_start: record.window_start,
            weight: record.weight.clamp(1, base_weight),
            base_weight,
            cooldown_level: record.cooldown_level,
            trial_in_flight: false,
            trial_epoch: 0,
            registered_at: record.registered_at,
        })
    }
}

/// Advance a timestamp field without ever moving it backwards
pub(crate) fn stamp(field: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    *field = Some(match *field {
        Some(existing) => existing.max(now),
        None => now,
    });
}

// ============================================================================
// Snapshots & Records
// ============================================================================

/// Read-only view of a credential for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialSnapshot {
    pub id: CredentialId,
    pub status: CredentialStatus,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub weight: u32,
    /// A half-open trial request is outstanding
    pub trial_in_flight: bool,
}

/// Persisted form of a credential's health state
///
/// `status` is kept as free text because it comes back from an external
/// store; it is parsed into [`CredentialStatus`] on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub status: String,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_transient_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_selected_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub window_start: DateTime<Utc>,
    pub weight: u32,
    pub base_weight: u32,
    #[serde(default)]
    pub cooldown_level: u32,
    pub registered_at: DateTime<Utc>,
}

/// Counts of credentials per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolHealthSummary {
    pub healthy_count: usize,
    pub degraded_count: usize,
    pub open_count: usize,
    pub half_open_count: usize,
    pub disabled_count: usize,
    pub total: usize,
    /// At least one credential is currently eligible for selection
    pub is_serving: bool,
}

impl PoolHealthSummary {
    pub(crate) fn count(&mut self, state: &CredentialState) {
        match state.status {
            CredentialStatus::Healthy => self.healthy_count += 1,
            CredentialStatus::Degraded => self.degraded_count += 1,
            CredentialStatus::Open => self.open_count += 1,
            CredentialStatus::HalfOpen => self.half_open_count += 1,
            CredentialStatus::Disabled => self.disabled_count += 1,
        }
        self.total += 1;
        if state.status == CredentialStatus::Healthy || state.trial_available() {
            self.is_serving = true;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
