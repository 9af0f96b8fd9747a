//! Per-credential circuit breaker
//!
//! Every transition here runs on a `CredentialState` that the caller holds
//! exclusively (inside the slot mutex), so thresholds are crossed exactly once.

use super::credential::{stamp, CredentialState, CredentialStatus, Outcome};
use crate::utils::Backoff;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Thresholds and timings driving the state machine
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    /// Consecutive credential errors before HEALTHY becomes DEGRADED
    pub degrade_threshold: u32,
    /// Consecutive credential errors before the circuit opens
    pub open_threshold: u32,
    /// Consecutive transport errors before the circuit opens
    pub transport_threshold: u32,
    /// Cool-down growth; `base` is the first cool-down, `max` the cap
    pub cooldown: Backoff,
    /// Length of the usage bookkeeping window
    pub usage_window: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degrade_threshold: 2,
            open_threshold: 5,
            transport_threshold: 3,
            cooldown: Backoff::new(Duration::from_secs(60), Duration::from_secs(600)),
            usage_window: Duration::from_secs(3600),
        }
    }
}

impl HealthPolicy {
    /// Cool-down to wait for a circuit opened at `level`
    pub fn cooldown_for(&self, level: u32) -> Duration {
        self.cooldown.delay_for(level)
    }

    pub fn base_cooldown(&self) -> Duration {
        self.cooldown.base
    }
}

/// A status transition produced by one atomic step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: CredentialStatus,
    pub to: CredentialStatus,
}

impl StatusChange {
    fn between(from: CredentialStatus, to: CredentialStatus) -> Option<Self> {
        (from != to).then_some(Self { from, to })
    }
}

/// How a credential was claimed by a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Regular,
    /// Half-open trial, tagged with the trial epoch it occupies
    Trial(u64),
}

fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

impl CredentialState {
    /// Apply one forwarding outcome
    pub(crate) fn record(
        &mut self,
        outcome: Outcome,
        now: DateTime<Utc>,
        policy: &HealthPolicy,
    ) -> Option<StatusChange> {
        let from = self.status;
        match (from, outcome) {
            (CredentialStatus::Disabled, _) => return None,
            (_, Outcome::Success) => self.on_success(now),
            (_, Outcome::CredentialError) => self.on_credential_error(now, policy),
            (_, Outcome::TransientError) => self.on_transient_error(now, policy),
        }
        StatusChange::between(from, self.status)
    }

    /// Apply the outcome of an attempt made under `claim`
    ///
    /// While half-open, only the current trial decides the circuit. Any other
    /// claim was taken before the circuit opened; its report updates the
    /// counters and leaves the status and the trial slot alone.
    pub(crate) fn record_claimed(
        &mut self,
        outcome: Outcome,
        claim: Claim,
        now: DateTime<Utc>,
        policy: &HealthPolicy,
    ) -> Option<StatusChange> {
        let current_trial =
            matches!(claim, Claim::Trial(epoch) if self.trial_in_flight && epoch == self.trial_epoch);
        if self.status == CredentialStatus::HalfOpen && !current_trial {
            self.record_late(outcome, now);
            return None;
        }
        self.record(outcome, now, policy)
    }

    fn record_late(&mut self, outcome: Outcome, now: DateTime<Utc>) {
        match outcome {
            Outcome::Success => {
                stamp(&mut self.last_success_at, now);
                self.consecutive_failures = 0;
                self.consecutive_transient_failures = 0;
            }
            Outcome::CredentialError => {
                stamp(&mut self.last_failure_at, now);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_transient_failures = 0;
            }
            Outcome::TransientError => {
                stamp(&mut self.last_failure_at, now);
                self.consecutive_transient_failures = self.consecutive_transient_failures.saturating_add(1);
            }
        }
    }

    fn on_success(&mut self, now: DateTime<Utc>) {
        stamp(&mut self.last_success_at, now);
        self.consecutive_failures = 0;
        self.consecutive_transient_failures = 0;
        if self.weight < self.base_weight {
            self.weight += 1;
        }

        match self.status {
            CredentialStatus::HalfOpen => {
                self.cooldown_level = 0;
                self.trial_in_flight = false;
                self.status = CredentialStatus::Healthy;
            }
            CredentialStatus::Degraded => self.status = CredentialStatus::Healthy,
            // Late report on an open circuit: counters only
            _ => {}
        }
    }

    fn on_credential_error(&mut self, now: DateTime<Utc>, policy: &HealthPolicy) {
        stamp(&mut self.last_failure_at, now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_transient_failures = 0;

        match self.status {
            CredentialStatus::Healthy | CredentialStatus::Degraded => {
                if self.consecutive_failures >= policy.open_threshold {
                    self.open(now);
                } else if self.status == CredentialStatus::Healthy
                    && self.consecutive_failures >= policy.degrade_threshold
                {
                    self.status = CredentialStatus::Degraded;
                    self.weight = (self.weight / 2).max(1);
                }
            }
            CredentialStatus::HalfOpen => {
                self.cooldown_level = self.cooldown_level.saturating_add(1);
                self.open(now);
            }
            CredentialStatus::Open | CredentialStatus::Disabled => {}
        }
    }

    fn on_transient_error(&mut self, now: DateTime<Utc>, policy: &HealthPolicy) {
        stamp(&mut self.last_failure_at, now);
        self.consecutive_transient_failures = self.consecutive_transient_failures.saturating_add(1);

        if self.status == CredentialStatus::Open {
            return;
        }
        if self.consecutive_transient_failures >= policy.transport_threshold {
            self.open(now);
        } else if self.status == CredentialStatus::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.status = CredentialStatus::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.consecutive_transient_failures = 0;
    }

    /// Time-driven step run by the rotation monitor
    pub(crate) fn advance(&mut self, now: DateTime<Utc>, policy: &HealthPolicy) -> Option<StatusChange> {
        let from = self.status;
        if from == CredentialStatus::Disabled {
            return None;
        }

        if elapsed(now, self.window_start) >= policy.usage_window {
            self.usage_count = 0;
            self.window_start = now;
        }

        let ready = match from {
            CredentialStatus::Open => self
                .opened_at
                .map_or(true, |opened| elapsed(now, opened) >= policy.cooldown_for(self.cooldown_level)),
            CredentialStatus::Degraded => self
                .last_failure_at
                .map_or(true, |failed| elapsed(now, failed) >= policy.base_cooldown()),
            _ => false,
        };
        if ready {
            self.status = CredentialStatus::HalfOpen;
            self.opened_at = None;
            self.trial_in_flight = false;
        }

        StatusChange::between(from, self.status)
    }

    /// Take the credential for one request, if it is eligible
    pub(crate) fn try_claim(&mut self, now: DateTime<Utc>) -> Option<Claim> {
        let claim = match self.status {
            CredentialStatus::Healthy => Claim::Regular,
            CredentialStatus::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                self.trial_epoch += 1;
                Claim::Trial(self.trial_epoch)
            }
            _ => return None,
        };
        self.usage_count = self.usage_count.saturating_add(1);
        stamp(&mut self.last_selected_at, now);
        Some(claim)
    }

    /// Free a trial slot abandoned without a report
    pub(crate) fn release_trial(&mut self, epoch: u64) -> bool {
        if self.status == CredentialStatus::HalfOpen && self.trial_in_flight && self.trial_epoch == epoch {
            self.trial_in_flight = false;
            true
        } else {
            false
        }
    }

    pub(crate) fn disable(&mut self) -> Option<StatusChange> {
        let from = self.status;
        self.status = CredentialStatus::Disabled;
        self.trial_in_flight = false;
        StatusChange::between(from, self.status)
    }

    /// Re-admit a disabled credential; other statuses are left alone
    pub(crate) fn enable(&mut self) -> Option<StatusChange> {
        if self.status != CredentialStatus::Disabled {
            return None;
        }
        self.restore_healthy();
        StatusChange::between(CredentialStatus::Disabled, CredentialStatus::Healthy)
    }

    /// Manual circuit reset; disabled credentials stay disabled
    pub(crate) fn reset(&mut self) -> Option<StatusChange> {
        let from = self.status;
        if from == CredentialStatus::Disabled {
            return None;
        }
        self.restore_healthy();
        StatusChange::between(from, self.status)
    }

    fn restore_healthy(&mut self) {
        self.status = CredentialStatus::Healthy;
        self.consecutive_failures = 0;
        self.consecutive_transient_failures = 0;
        self.opened_at = None;
        self.weight = self.base_weight;
        self.cooldown_level = 0;
        self.trial_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn policy() -> HealthPolicy {
        HealthPolicy::default()
    }

    fn fail(state: &mut CredentialState, times: u32, now: DateTime<Utc>) -> Vec<StatusChange> {
        (0..times)
            .filter_map(|_| state.record(Outcome::CredentialError, now, &policy()))
            .collect()
    }

    #[test]
    fn test_healthy_degrades_then_opens() {
        let now = Utc::now();
        let mut state = CredentialState::new(8, now);

        assert!(state.record(Outcome::CredentialError, now, &policy()).is_none());
        assert_eq!(state.status, CredentialStatus::Healthy);

        let change = state.record(Outcome::CredentialError, now, &policy());
        assert_eq!(
            change,
            Some(StatusChange {
                from: CredentialStatus::Healthy,
                to: CredentialStatus::Degraded
            })
        );
        assert_eq!(state.weight, 4);

        assert!(fail(&mut state, 2, now).is_empty());
        assert_eq!(state.consecutive_failures, 4);

        let change = state.record(Outcome::CredentialError, now, &policy());
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Open));
        assert_eq!(state.opened_at, Some(now));
        assert_eq!(state.consecutive_failures, 5);
    }

    #[test]
    fn test_healthy_jumps_straight_to_open() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        let policy = HealthPolicy {
            degrade_threshold: 3,
            open_threshold: 3,
            ..HealthPolicy::default()
        };

        state.record(Outcome::CredentialError, now, &policy);
        state.record(Outcome::CredentialError, now, &policy);
        let change = state.record(Outcome::CredentialError, now, &policy);
        assert_eq!(
            change,
            Some(StatusChange {
                from: CredentialStatus::Healthy,
                to: CredentialStatus::Open
            })
        );
    }

    #[test]
    fn test_success_on_degraded_restores_healthy() {
        let now = Utc::now();
        let mut state = CredentialState::new(8, now);
        fail(&mut state, 2, now);
        assert_eq!(state.status, CredentialStatus::Degraded);

        let later = now + ChronoDuration::seconds(1);
        let change = state.record(Outcome::Success, later, &policy());
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Healthy));
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_success_at, Some(later));
        assert_eq!(state.weight, 5);
    }

    #[test]
    fn test_open_waits_for_cooldown() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        fail(&mut state, 5, now);
        assert_eq!(state.status, CredentialStatus::Open);

        assert!(state.advance(now + ChronoDuration::seconds(59), &policy()).is_none());
        assert_eq!(state.try_claim(now + ChronoDuration::seconds(59)), None);

        let change = state.advance(now + ChronoDuration::seconds(60), &policy());
        assert_eq!(
            change,
            Some(StatusChange {
                from: CredentialStatus::Open,
                to: CredentialStatus::HalfOpen
            })
        );
        assert_eq!(state.opened_at, None);
    }

    #[test]
    fn test_half_open_failure_doubles_cooldown() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        fail(&mut state, 5, now);
        state.advance(now + ChronoDuration::seconds(60), &policy());

        let trial_at = now + ChronoDuration::seconds(61);
        assert_eq!(state.try_claim(trial_at), Some(Claim::Trial(1)));
        state.record(Outcome::CredentialError, trial_at, &policy());
        assert_eq!(state.status, CredentialStatus::Open);
        assert_eq!(state.cooldown_level, 1);
        assert_eq!(state.opened_at, Some(trial_at));

        assert!(state.advance(trial_at + ChronoDuration::seconds(119), &policy()).is_none());
        assert!(state.advance(trial_at + ChronoDuration::seconds(120), &policy()).is_some());
    }

    #[test]
    fn test_cooldown_is_capped() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        state.status = CredentialStatus::Open;
        state.opened_at = Some(now);
        state.cooldown_level = 30;

        assert!(state.advance(now + ChronoDuration::seconds(599), &policy()).is_none());
        assert!(state.advance(now + ChronoDuration::seconds(600), &policy()).is_some());
    }

    #[test]
    fn test_half_open_success_closes_circuit() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        fail(&mut state, 5, now);
        state.advance(now + ChronoDuration::seconds(60), &policy());
        state.cooldown_level = 2;
        state.try_claim(now + ChronoDuration::seconds(61));

        let change = state.record(Outcome::Success, now + ChronoDuration::seconds(62), &policy());
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Healthy));
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.cooldown_level, 0);
        assert!(!state.trial_in_flight);
    }

    #[test]
    fn test_late_regular_report_leaves_half_open_alone() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        fail(&mut state, 5, now);
        state.advance(now + ChronoDuration::seconds(60), &policy());
        let trial = state.try_claim(now + ChronoDuration::seconds(61)).unwrap();

        let late = now + ChronoDuration::seconds(62);
        assert!(state
            .record_claimed(Outcome::Success, Claim::Regular, late, &policy())
            .is_none());
        assert_eq!(state.status, CredentialStatus::HalfOpen);
        assert!(state.trial_in_flight);
        assert_eq!(state.last_success_at, Some(late));
        assert_eq!(state.consecutive_failures, 0);

        assert!(state
            .record_claimed(Outcome::CredentialError, Claim::Regular, late, &policy())
            .is_none());
        assert_eq!(state.status, CredentialStatus::HalfOpen);
        assert_eq!(state.cooldown_level, 0);
        assert_eq!(state.consecutive_failures, 1);

        let change = state.record_claimed(Outcome::Success, trial, late, &policy());
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Healthy));
    }

    #[test]
    fn test_stale_trial_report_is_late() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        state.status = CredentialStatus::HalfOpen;
        let stale = state.try_claim(now).unwrap();
        assert!(state.release_trial(1));
        let current = state.try_claim(now).unwrap();

        assert!(state
            .record_claimed(Outcome::CredentialError, stale, now, &policy())
            .is_none());
        assert_eq!(state.status, CredentialStatus::HalfOpen);

        let change = state.record_claimed(Outcome::CredentialError, current, now, &policy());
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Open));
        assert_eq!(state.cooldown_level, 1);
    }

    #[test]
    fn test_one_trial_at_a_time() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        state.status = CredentialStatus::HalfOpen;

        let first = state.try_claim(now);
        assert_eq!(first, Some(Claim::Trial(1)));
        assert_eq!(state.try_claim(now), None);

        assert!(!state.release_trial(0));
        assert!(state.release_trial(1));
        assert_eq!(state.try_claim(now), Some(Claim::Trial(2)));

        // stale lease from the first trial cannot free the second
        assert!(!state.release_trial(1));
        assert!(state.trial_in_flight);
    }

    #[test]
    fn test_transient_errors_use_separate_counter() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);

        state.record(Outcome::TransientError, now, &policy());
        state.record(Outcome::TransientError, now, &policy());
        assert_eq!(state.status, CredentialStatus::Healthy);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.consecutive_transient_failures, 2);
        assert_eq!(state.last_failure_at, Some(now));

        let change = state.record(Outcome::TransientError, now, &policy());
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Open));
        assert_eq!(state.consecutive_transient_failures, 0);
        assert_eq!(state.opened_at, Some(now));
    }

    #[test]
    fn test_transient_on_trial_frees_slot() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        state.status = CredentialStatus::HalfOpen;
        state.try_claim(now);

        assert!(state.record(Outcome::TransientError, now, &policy()).is_none());
        assert_eq!(state.status, CredentialStatus::HalfOpen);
        assert!(state.trial_available());
    }

    #[test]
    fn test_late_report_on_open_keeps_circuit() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        fail(&mut state, 5, now);

        let later = now + ChronoDuration::seconds(5);
        assert!(state.record(Outcome::Success, later, &policy()).is_none());
        assert_eq!(state.status, CredentialStatus::Open);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.opened_at, Some(now));

        assert!(state.record(Outcome::CredentialError, later, &policy()).is_none());
        assert_eq!(state.opened_at, Some(now));
    }

    #[test]
    fn test_disabled_ignores_reports_and_sweeps() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        state.disable();

        let before = state.clone();
        assert!(state.record(Outcome::CredentialError, now, &policy()).is_none());
        assert!(state.advance(now + ChronoDuration::days(2), &policy()).is_none());
        assert_eq!(state, before);
        assert_eq!(state.try_claim(now), None);
    }

    #[test]
    fn test_enable_only_from_disabled() {
        let now = Utc::now();
        let mut state = CredentialState::new(6, now);
        fail(&mut state, 2, now);
        assert!(state.enable().is_none());
        assert_eq!(state.status, CredentialStatus::Degraded);

        state.disable();
        let change = state.enable();
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Healthy));
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.weight, 6);
    }

    #[test]
    fn test_reset_skips_disabled() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        fail(&mut state, 5, now);
        state.cooldown_level = 3;

        assert_eq!(state.reset().map(|c| c.to), Some(CredentialStatus::Healthy));
        assert_eq!(state.cooldown_level, 0);
        assert_eq!(state.opened_at, None);

        state.disable();
        assert!(state.reset().is_none());
        assert_eq!(state.status, CredentialStatus::Disabled);
    }

    #[test]
    fn test_degraded_promoted_after_quiet_period() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        fail(&mut state, 2, now);

        assert!(state.advance(now + ChronoDuration::seconds(30), &policy()).is_none());
        let change = state.advance(now + ChronoDuration::seconds(60), &policy());
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::HalfOpen));
    }

    #[test]
    fn test_usage_window_refresh() {
        let now = Utc::now();
        let mut state = CredentialState::new(1, now);
        state.try_claim(now);
        state.try_claim(now);
        assert_eq!(state.usage_count, 2);

        state.advance(now + ChronoDuration::minutes(30), &policy());
        assert_eq!(state.usage_count, 2);

        let next_window = now + ChronoDuration::hours(1);
        state.advance(next_window, &policy());
        assert_eq!(state.usage_count, 0);
        assert_eq!(state.window_start, next_window);
    }
}
