//! Selection strategy
//!
//! Weighted least-recently-used with a half-open trial quota:
//! - half-open credentials with a free trial slot go first so they can recover
//! - healthy credentials are ranked by `idle time × weight`, never-used first
//! - ties fall to the lower `usage_count`, then the lower id

use super::credential::{CredentialState, CredentialStatus};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;

/// Eligibility tier, lower is preferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Tier {
    Trial,
    Healthy,
}

/// Sort key for one candidate; smaller keys are selected first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RankKey {
    tier: Tier,
    idle_score: Reverse<u128>,
    usage_count: u64,
}

/// Rank a credential for selection at `now`, or `None` if it is not eligible
pub(crate) fn rank(state: &CredentialState, now: DateTime<Utc>) -> Option<RankKey> {
    let tier = match state.status {
        CredentialStatus::HalfOpen if state.trial_available() => Tier::Trial,
        CredentialStatus::Healthy => Tier::Healthy,
        _ => return None,
    };

    let idle_score = match state.last_used_at() {
        Some(used) => {
            let idle = (now - used).to_std().map(|d| d.as_nanos()).unwrap_or(0);
            idle.saturating_mul(u128::from(state.weight))
        }
        None => u128::MAX,
    };

    Some(RankKey {
        tier,
        idle_score: Reverse(idle_score),
        usage_count: state.usage_count,
    })
}
