//! Credential Pool Implementation
//!
//! The pool owns one `CredentialSlot` per credential. A slot's mutex is the
//! only way to change that credential's state, so selection, outcome reports
//! and monitor sweeps on the same credential are serialized while different
//! credentials never contend with each other.

use super::credential::{
    CredentialId, CredentialRecord, CredentialSnapshot, CredentialState, CredentialStatus, Outcome,
    PoolHealthSummary,
};
use super::error::PoolError;
use super::health::{Claim, HealthPolicy, StatusChange};
use super::store::{CredentialStore, InMemoryCredentialStore};
use super::strategy;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Configuration for credential pool behavior
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Circuit breaker thresholds and timings
    pub policy: HealthPolicy,
    /// Weight given to credentials registered without one
    pub default_weight: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            policy: HealthPolicy::default(),
            default_weight: 8,
        }
    }
}

impl PoolConfig {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn with_default_weight(mut self, weight: u32) -> Self {
        self.default_weight = weight.max(1);
        self
    }
}

// ============================================================================
// Credential Slot
// ============================================================================

/// One credential and the lock that serializes its transitions
#[derive(Debug)]
pub(crate) struct CredentialSlot {
    id: CredentialId,
    state: Mutex<CredentialState>,
}

impl CredentialSlot {
    fn new(id: CredentialId, state: CredentialState) -> Self {
        Self {
            id,
            state: Mutex::new(state),
        }
    }

    /// Run `f` with exclusive access to the credential state
    pub(crate) fn transition<R>(&self, f: impl FnOnce(&mut CredentialState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

// ============================================================================
// Lease
// ============================================================================

/// A selected credential, valid for one forwarding attempt
///
/// Dropping a half-open trial lease without settling it frees the trial
/// slot, so a cancelled request never wedges a recovering credential.
#[derive(Debug)]
pub struct Lease {
    slot: Arc<CredentialSlot>,
    claim: Claim,
    settled: bool,
}

impl Lease {
    pub fn id(&self) -> &CredentialId {
        &self.slot.id
    }

    /// Whether this lease occupies a half-open trial slot
    pub fn is_trial(&self) -> bool {
        matches!(self.claim, Claim::Trial(_))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Claim::Trial(epoch) = self.claim {
            if self.slot.transition(|state| state.release_trial(epoch)) {
                tracing::debug!(credential = %self.slot.id.short(), "Released unreported trial slot");
            }
        }
    }
}

// ============================================================================
// Credential Pool
// ============================================================================

/// Pool of upstream credentials with per-credential circuit breakers
pub struct CredentialPool {
    slots: RwLock<HashMap<CredentialId, Arc<CredentialSlot>>>,
    config: PoolConfig,
    store: Arc<dyn CredentialStore>,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("credentials", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

impl CredentialPool {
    /// Create an empty pool over `store`
    ///
    /// Nothing is loaded from the store until [`CredentialPool::restore`] runs.
    pub fn new(config: PoolConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            config,
            store,
        }
    }

    /// Pool backed by a process-local store
    pub fn in_memory(config: PoolConfig) -> Self {
        Self::new(config, Arc::new(InMemoryCredentialStore::new()))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of credentials, disabled ones included
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &CredentialId) -> Option<Arc<CredentialSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn require_slot(&self, id: &CredentialId) -> Result<Arc<CredentialSlot>, PoolError> {
        self.slot(id)
            .ok_or_else(|| PoolError::UnknownCredential(id.clone()))
    }

    /// Clone the slot handles so no pool-wide lock is held during transitions
    fn all_slots(&self) -> Vec<Arc<CredentialSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------------

    /// Select an eligible credential
    ///
    /// Half-open credentials with a free trial slot come first, then healthy
    /// ones by weighted least-recent use. Fails with
    /// [`PoolError::PoolExhausted`] when nothing is selectable.
    pub fn select(&self) -> Result<Lease, PoolError> {
        self.select_at(&[], Utc::now())
    }

    /// Select an eligible credential not listed in `exclude`
    pub fn select_excluding(&self, exclude: &[CredentialId]) -> Result<Lease, PoolError> {
        self.select_at(exclude, Utc::now())
    }

    /// Select with an explicit clock, skipping `exclude`
    ///
    /// Every other selection entry point ends up here. `now` stamps the
    /// claim and feeds the least-recently-used ranking.
    pub fn select_at(&self, exclude: &[CredentialId], now: DateTime<Utc>) -> Result<Lease, PoolError> {
        let mut ranked: Vec<_> = self
            .all_slots()
            .into_iter()
            .filter(|slot| !exclude.contains(&slot.id))
            .filter_map(|slot| {
                let key = slot.transition(|state| strategy::rank(state, now))?;
                Some((key, slot))
            })
            .collect();
        ranked.sort_by(|(a, slot_a), (b, slot_b)| a.cmp(b).then_with(|| slot_a.id.cmp(&slot_b.id)));

        // Rank and claim are separate lock sections; a candidate that changed
        // in between simply refuses the claim and the next one is tried.
        for (_, slot) in ranked {
            if let Some(claim) = slot.transition(|state| state.try_claim(now)) {
                if let Claim::Trial(epoch) = claim {
                    tracing::info!(credential = %slot.id.short(), epoch, "Half-open trial started");
                }
                return Ok(Lease {
                    slot,
                    claim,
                    settled: false,
                });
            }
        }

        Err(PoolError::PoolExhausted)
    }

    /// Report the outcome of an attempt made with `id`
    ///
    /// A report without a lease is taken at face value, including on a
    /// half-open credential. Prefer [`CredentialPool::settle`] when the lease
    /// is at hand.
    pub fn report(&self, id: &CredentialId, outcome: Outcome) -> Result<Option<StatusChange>, PoolError> {
        self.report_at(id, outcome, Utc::now())
    }

    /// [`CredentialPool::report`] with an explicit clock
    pub fn report_at(
        &self,
        id: &CredentialId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>, PoolError> {
        self.apply_outcome(id, outcome, None, now)
    }

    /// Report the outcome for a lease, consuming it
    ///
    /// The lease's claim goes along with the report: on a half-open
    /// credential only the current trial lease can close or reopen the
    /// circuit, older leases just update the counters.
    pub fn settle(&self, mut lease: Lease, outcome: Outcome) -> Result<Option<StatusChange>, PoolError> {
        lease.settled = true;
        self.apply_outcome(lease.id(), outcome, Some(lease.claim), Utc::now())
    }

    fn apply_outcome(
        &self,
        id: &CredentialId,
        outcome: Outcome,
        claim: Option<Claim>,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>, PoolError> {
        let slot = self.require_slot(id).map_err(|err| {
            tracing::error!(credential = %id.short(), %outcome, "Outcome reported for unknown credential");
            err
        })?;

        let policy = &self.config.policy;
        let (change, failures) = slot.transition(|state| {
            if state.status == CredentialStatus::Disabled {
                tracing::debug!(credential = %id.short(), %outcome, "Ignoring report for disabled credential");
            }
            let change = match claim {
                Some(claim) => state.record_claimed(outcome, claim, now, policy),
                None => state.record(outcome, now, policy),
            };
            (change, state.consecutive_failures)
        });

        if let Some(change) = change {
            log_change(id, change, "outcome", failures);
        }
        Ok(change)
    }

    /// Run the time-driven step on every credential
    pub(crate) fn advance_all(&self, now: DateTime<Utc>) -> Vec<(CredentialId, StatusChange)> {
        self.all_slots()
            .into_iter()
            .filter_map(|slot| {
                let change = slot.transition(|state| state.advance(now, &self.config.policy))?;
                log_change(&slot.id, change, "sweep", 0);
                Some((slot.id.clone(), change))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Management surface
    // ------------------------------------------------------------------------

    /// Register a secret with the default weight; returns its id
    pub async fn register(&self, secret: SecretString) -> Result<CredentialId, PoolError> {
        self.register_weighted(secret, self.config.default_weight).await
    }

    /// Register a secret with an explicit selection weight
    ///
    /// Registering a known secret again returns the existing id untouched.
    pub async fn register_weighted(&self, secret: SecretString, weight: u32) -> Result<CredentialId, PoolError> {
        let trimmed = secret.expose_secret().trim();
        if trimmed.is_empty() {
            return Err(PoolError::EmptySecret);
        }
        let id = CredentialId::from_secret(trimmed);
        if self.slot(&id).is_some() {
            tracing::debug!(credential = %id.short(), "Credential already registered");
            return Ok(id);
        }

        self.store
            .put_secret(&id, SecretString::new(trimmed.into()))
            .await?;

        let inserted = match self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
        {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let state = CredentialState::new(weight, Utc::now());
                entry.insert(Arc::new(CredentialSlot::new(id.clone(), state)));
                true
            }
        };
        if inserted {
            tracing::info!(credential = %id.short(), weight = weight.max(1), "Credential registered");
        }
        Ok(id)
    }

    /// Remove a credential and its secret; unknown ids are accepted
    pub async fn remove(&self, id: &CredentialId) -> Result<(), PoolError> {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        self.store.delete(id).await?;
        if removed {
            tracing::info!(credential = %id.short(), "Credential removed");
        }
        Ok(())
    }

    /// Fetch the secret for one forwarding attempt
    pub async fn secret_for(&self, id: &CredentialId) -> Result<SecretString, PoolError> {
        self.store
            .fetch_secret(id)
            .await?
            .ok_or_else(|| PoolError::UnknownCredential(id.clone()))
    }

    /// Take a credential out of rotation until it is enabled again
    ///
    /// Disabled credentials ignore outcome reports and monitor sweeps.
    pub fn disable(&self, id: &CredentialId) -> Result<(), PoolError> {
        self.admin_transition(id, "disable", CredentialState::disable)
    }

    /// Return a disabled credential to HEALTHY with fresh counters
    ///
    /// A no-op for credentials that are not disabled.
    pub fn enable(&self, id: &CredentialId) -> Result<(), PoolError> {
        self.admin_transition(id, "enable", CredentialState::enable)
    }

    /// Close the circuit of any non-disabled credential
    pub fn reset_credential(&self, id: &CredentialId) -> Result<(), PoolError> {
        self.admin_transition(id, "reset", CredentialState::reset)
    }

    fn admin_transition(
        &self,
        id: &CredentialId,
        action: &'static str,
        f: fn(&mut CredentialState) -> Option<StatusChange>,
    ) -> Result<(), PoolError> {
        let slot = self.require_slot(id)?;
        match slot.transition(f) {
            Some(change) => tracing::info!(
                credential = %id.short(),
                action,
                from = %change.from,
                to = %change.to,
                "Credential updated by administrator"
            ),
            None => tracing::debug!(credential = %id.short(), action, "Administrative action was a no-op"),
        }
        Ok(())
    }

    /// Current status, or `None` for an unknown id
    pub fn status_of(&self, id: &CredentialId) -> Option<CredentialStatus> {
        self.slot(id).map(|slot| slot.transition(|state| state.status))
    }

    /// Point-in-time view of one credential
    pub fn snapshot(&self, id: &CredentialId) -> Option<CredentialSnapshot> {
        self.slot(id).map(|slot| slot.transition(|state| state.snapshot(&slot.id)))
    }

    /// Snapshot of every credential, ordered by id
    pub fn list(&self) -> Vec<CredentialSnapshot> {
        let mut snapshots: Vec<_> = self
            .all_slots()
            .into_iter()
            .map(|slot| slot.transition(|state| state.snapshot(&slot.id)))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Credential counts per status
    pub fn summary(&self) -> PoolHealthSummary {
        let mut summary = PoolHealthSummary::default();
        for slot in self.all_slots() {
            slot.transition(|state| summary.count(state));
        }
        summary
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Persistable records for every credential, ordered by id
    pub fn records(&self) -> Vec<CredentialRecord> {
        let mut records: Vec<_> = self
            .all_slots()
            .into_iter()
            .map(|slot| slot.transition(|state| state.to_record(&slot.id)))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Write every credential's record to the store
    pub async fn persist(&self) -> Result<usize, PoolError> {
        let records = self.records();
        let count = records.len();
        self.store.save_records(records).await?;
        Ok(count)
    }

    /// Rebuild pool state from stored records
    ///
    /// All records are validated before any is applied. Records whose secret
    /// is missing from the store are skipped.
    pub async fn restore(&self) -> Result<usize, PoolError> {
        let records = self.store.load_records().await?;

        let mut states = Vec::with_capacity(records.len());
        for record in &records {
            let state = CredentialState::from_record(record).map_err(|err| PoolError::InvalidStatus {
                id: record.id.clone(),
                value: err.0,
            })?;
            states.push((record.id.clone(), state));
        }

        let mut restored = 0;
        for (id, state) in states {
            if self.store.fetch_secret(&id).await?.is_none() {
                tracing::warn!(credential = %id.short(), "Skipping stored record without a secret");
                continue;
            }
            self.slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.clone(), Arc::new(CredentialSlot::new(id, state)));
            restored += 1;
        }

        tracing::info!(restored, "Credential pool restored from store");
        Ok(restored)
    }
}

fn log_change(id: &CredentialId, change: StatusChange, cause: &'static str, failures: u32) {
    match change.to {
        CredentialStatus::Open | CredentialStatus::Degraded => tracing::warn!(
            credential = %id.short(),
            from = %change.from,
            to = %change.to,
            cause,
            consecutive_failures = failures,
            "Credential health degraded"
        ),
        _ => tracing::info!(
            credential = %id.short(),
            from = %change.from,
            to = %change.to,
            cause,
            "Credential health changed"
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn secret(raw: &str) -> SecretString {
        SecretString::new(raw.into())
    }

    async fn pool_with(n: usize) -> (CredentialPool, Vec<CredentialId>) {
        let pool = CredentialPool::in_memory(PoolConfig::default());
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(pool.register(secret(&format!("sk-test-key-{i:04}"))).await.unwrap());
        }
        (pool, ids)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let pool = CredentialPool::in_memory(PoolConfig::default());
        let id = pool.register(secret("sk-test-key-0001")).await.unwrap();
        pool.report(&id, Outcome::CredentialError).unwrap();

        let again = pool.register(secret("  sk-test-key-0001  ")).await.unwrap();
        assert_eq!(id, again);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.snapshot(&id).unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_register_rejects_blank_secret() {
        let pool = CredentialPool::in_memory(PoolConfig::default());
        assert!(matches!(
            pool.register(secret("   ")).await,
            Err(PoolError::EmptySecret)
        ));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_secret_is_served_from_store() {
        let (pool, ids) = pool_with(1).await;
        let secret = pool.secret_for(&ids[0]).await.unwrap();
        assert_eq!(secret.expose_secret(), "sk-test-key-0000");

        pool.remove(&ids[0]).await.unwrap();
        assert!(matches!(
            pool.secret_for(&ids[0]).await,
            Err(PoolError::UnknownCredential(_))
        ));
        pool.remove(&ids[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_select_empty_pool() {
        let pool = CredentialPool::in_memory(PoolConfig::default());
        assert!(matches!(pool.select(), Err(PoolError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_select_rotates_evenly() {
        let (pool, ids) = pool_with(3).await;
        let now = Utc::now();

        let mut counts: HashMap<CredentialId, usize> = HashMap::new();
        for _ in 0..9 {
            let lease = pool.select_at(&[], now).unwrap();
            *counts.entry(lease.id().clone()).or_default() += 1;
            pool.settle(lease, Outcome::Success).unwrap();
        }

        for id in &ids {
            assert_eq!(counts[id], 3);
        }
    }

    #[tokio::test]
    async fn test_select_respects_exclusions() {
        let (pool, ids) = pool_with(2).await;

        let lease = pool.select_excluding(&[ids[0].clone()]).unwrap();
        assert_eq!(lease.id(), &ids[1]);

        assert!(matches!(
            pool.select_excluding(&ids),
            Err(PoolError::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn test_select_never_returns_open_or_disabled() {
        let (pool, ids) = pool_with(3).await;
        for _ in 0..5 {
            pool.report(&ids[0], Outcome::CredentialError).unwrap();
        }
        pool.disable(&ids[1]).unwrap();

        for _ in 0..10 {
            let lease = pool.select().unwrap();
            assert_eq!(lease.id(), &ids[2]);
        }
    }

    #[tokio::test]
    async fn test_half_open_trial_quota() {
        let (pool, ids) = pool_with(1).await;
        let now = Utc::now();
        for _ in 0..5 {
            pool.report_at(&ids[0], Outcome::CredentialError, now).unwrap();
        }
        pool.advance_all(now + Duration::seconds(60));
        assert_eq!(pool.status_of(&ids[0]), Some(CredentialStatus::HalfOpen));

        let trial = pool.select().unwrap();
        assert!(trial.is_trial());
        assert!(matches!(pool.select(), Err(PoolError::PoolExhausted)));

        // abandoned trial frees the slot
        drop(trial);
        let trial = pool.select().unwrap();
        pool.settle(trial, Outcome::Success).unwrap();
        assert_eq!(pool.status_of(&ids[0]), Some(CredentialStatus::Healthy));
    }

    #[tokio::test]
    async fn test_lease_from_before_open_cannot_decide_trial() {
        let (pool, ids) = pool_with(1).await;
        let now = Utc::now();

        let stale = pool.select().unwrap();
        assert!(!stale.is_trial());
        for _ in 0..5 {
            pool.report_at(&ids[0], Outcome::CredentialError, now).unwrap();
        }
        pool.advance_all(now + Duration::seconds(60));
        let trial = pool.select().unwrap();
        assert!(trial.is_trial());

        assert!(pool.settle(stale, Outcome::Success).unwrap().is_none());
        let snapshot = pool.snapshot(&ids[0]).unwrap();
        assert_eq!(snapshot.status, CredentialStatus::HalfOpen);
        assert!(snapshot.trial_in_flight);
        assert!(snapshot.last_success_at.is_some());
        assert!(matches!(pool.select(), Err(PoolError::PoolExhausted)));

        let change = pool.settle(trial, Outcome::Success).unwrap();
        assert_eq!(change.map(|c| c.to), Some(CredentialStatus::Healthy));
    }

    #[tokio::test]
    async fn test_late_failure_keeps_cooldown_level() {
        let (pool, ids) = pool_with(1).await;
        let now = Utc::now();

        let stale = pool.select().unwrap();
        for _ in 0..5 {
            pool.report_at(&ids[0], Outcome::CredentialError, now).unwrap();
        }
        pool.advance_all(now + Duration::seconds(60));

        assert!(pool.settle(stale, Outcome::CredentialError).unwrap().is_none());
        assert_eq!(pool.status_of(&ids[0]), Some(CredentialStatus::HalfOpen));

        // The failed trial doubles the cool-down once, not twice
        let trial = pool.select().unwrap();
        pool.settle(trial, Outcome::CredentialError).unwrap();
        let opened_at = pool.snapshot(&ids[0]).unwrap().opened_at.unwrap();
        assert!(pool.advance_all(opened_at + Duration::seconds(119)).is_empty());
        assert_eq!(pool.advance_all(opened_at + Duration::seconds(120)).len(), 1);
    }

    #[tokio::test]
    async fn test_report_unknown_credential() {
        let pool = CredentialPool::in_memory(PoolConfig::default());
        let id = CredentialId::from_secret("never-registered");
        assert!(matches!(
            pool.report(&id, Outcome::Success),
            Err(PoolError::UnknownCredential(_))
        ));
        assert!(matches!(pool.disable(&id), Err(PoolError::UnknownCredential(_))));
    }

    #[tokio::test]
    async fn test_disable_enable_round_trip() {
        let (pool, ids) = pool_with(2).await;
        pool.report(&ids[0], Outcome::CredentialError).unwrap();

        pool.disable(&ids[0]).unwrap();
        pool.disable(&ids[0]).unwrap();
        for _ in 0..4 {
            let lease = pool.select().unwrap();
            assert_ne!(lease.id(), &ids[0]);
        }

        pool.enable(&ids[0]).unwrap();
        let snapshot = pool.snapshot(&ids[0]).unwrap();
        assert_eq!(snapshot.status, CredentialStatus::Healthy);
        assert_eq!(snapshot.consecutive_failures, 0);

        let seen: HashSet<_> = (0..4).map(|_| pool.select().unwrap().id().clone()).collect();
        assert!(seen.contains(&ids[0]));
    }

    #[tokio::test]
    async fn test_reset_credential() {
        let (pool, ids) = pool_with(1).await;
        for _ in 0..5 {
            pool.report(&ids[0], Outcome::CredentialError).unwrap();
        }
        assert_eq!(pool.status_of(&ids[0]), Some(CredentialStatus::Open));

        pool.reset_credential(&ids[0]).unwrap();
        assert_eq!(pool.status_of(&ids[0]), Some(CredentialStatus::Healthy));
        assert!(pool.select().is_ok());
    }

    #[tokio::test]
    async fn test_summary() {
        let (pool, ids) = pool_with(4).await;
        for _ in 0..2 {
            pool.report(&ids[0], Outcome::CredentialError).unwrap();
        }
        for _ in 0..5 {
            pool.report(&ids[1], Outcome::CredentialError).unwrap();
        }
        pool.disable(&ids[2]).unwrap();

        let summary = pool.summary();
        assert_eq!(summary.healthy_count, 1);
        assert_eq!(summary.degraded_count, 1);
        assert_eq!(summary.open_count, 1);
        assert_eq!(summary.half_open_count, 0);
        assert_eq!(summary.disabled_count, 1);
        assert_eq!(summary.total, 4);
        assert!(summary.is_serving);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let pool = CredentialPool::new(PoolConfig::default(), store.clone());
        let id = pool.register(secret("sk-test-key-persist")).await.unwrap();
        for _ in 0..5 {
            pool.report(&id, Outcome::CredentialError).unwrap();
        }
        assert_eq!(pool.persist().await.unwrap(), 1);

        let fresh = CredentialPool::new(PoolConfig::default(), store);
        assert_eq!(fresh.restore().await.unwrap(), 1);
        let snapshot = fresh.snapshot(&id).unwrap();
        assert_eq!(snapshot.status, CredentialStatus::Open);
        assert_eq!(snapshot.consecutive_failures, 5);
    }

    #[tokio::test]
    async fn test_restore_rejects_unknown_status() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let pool = CredentialPool::new(PoolConfig::default(), store.clone());
        let id = pool.register(secret("sk-test-key-corrupt")).await.unwrap();

        let mut record = pool.records().remove(0);
        record.status = "RETIRED".to_string();
        store.save_records(vec![record]).await.unwrap();

        let fresh = CredentialPool::new(PoolConfig::default(), store);
        match fresh.restore().await {
            Err(PoolError::InvalidStatus { id: bad, value }) => {
                assert_eq!(bad, id);
                assert_eq!(value, "RETIRED");
            }
            other => panic!("expected InvalidStatus, got {other:?}"),
        }
        assert!(fresh.is_empty());
    }
}
