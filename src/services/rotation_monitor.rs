//! Rotation Monitor
//!
//! Background task that periodically advances time-driven credential
//! transitions (cool-down expiry, usage window refresh) and writes the
//! resulting records to the credential store.

use crate::services::credential_pool::{CredentialId, CredentialPool, StatusChange};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Result of one sweep over the pool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Credentials looked at
    pub examined: usize,
    /// Transitions applied, in no particular order
    pub changes: Vec<(CredentialId, StatusChange)>,
}

struct MonitorTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Periodic sweeper with an explicit start/stop lifecycle
pub struct RotationMonitor {
    pool: Arc<CredentialPool>,
    interval: Duration,
    task: Mutex<Option<MonitorTask>>,
}

impl RotationMonitor {
    pub fn new(pool: Arc<CredentialPool>, interval: Duration) -> Self {
        Self {
            pool,
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Sweep the pool once at the current time
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Sweep the pool once as of `now`
    ///
    /// Each credential is advanced under its own lock, so stopping the
    /// monitor between two credentials leaves every credential consistent.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        sweep_pool(&self.pool, now)
    }

    /// Start the background loop; returns false if it is already running
    pub fn start(&self) -> bool {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let pool = self.pool.clone();
        let period = self.interval;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep_pool(&pool, Utc::now());
                        if let Err(e) = pool.persist().await {
                            tracing::warn!(error = %e, "Failed to persist credential records");
                        }
                    }
                }
            }

            tracing::info!("Rotation monitor stopped");
        });

        tracing::info!(interval_secs = period.as_secs(), "Rotation monitor started");
        *slot = Some(MonitorTask { handle, cancel });
        true
    }

    /// Cancel the background loop and wait for it to finish
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::error!(error = %e, "Rotation monitor task failed");
            }
        }
    }
}

fn sweep_pool(pool: &CredentialPool, now: DateTime<Utc>) -> SweepReport {
    let examined = pool.len();
    let changes = pool.advance_all(now);

    if changes.is_empty() {
        tracing::debug!(examined, "Rotation sweep complete");
    } else {
        tracing::info!(examined, changed = changes.len(), "Rotation sweep applied transitions");
    }

    SweepReport { examined, changes }
}

impl Drop for RotationMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::credential_pool::{
        CredentialStatus, CredentialStore, InMemoryCredentialStore, Outcome, PoolConfig,
    };
    use chrono::Duration as ChronoDuration;
    use secrecy::SecretString;

    async fn open_pool() -> (Arc<CredentialPool>, CredentialId, DateTime<Utc>) {
        let pool = Arc::new(CredentialPool::in_memory(PoolConfig::default()));
        let id = pool
            .register(SecretString::new("sk-monitor-test-key".into()))
            .await
            .unwrap();
        let now = Utc::now();
        for _ in 0..5 {
            pool.report_at(&id, Outcome::CredentialError, now).unwrap();
        }
        (pool, id, now)
    }

    #[tokio::test]
    async fn test_sweep_half_opens_after_cooldown() {
        let (pool, id, opened) = open_pool().await;
        let monitor = RotationMonitor::new(pool.clone(), Duration::from_secs(30));

        let report = monitor.sweep_at(opened + ChronoDuration::seconds(30));
        assert_eq!(report.examined, 1);
        assert!(report.changes.is_empty());
        assert_eq!(pool.status_of(&id), Some(CredentialStatus::Open));

        let report = monitor.sweep_at(opened + ChronoDuration::seconds(60));
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].1.to, CredentialStatus::HalfOpen);
        assert_eq!(pool.status_of(&id), Some(CredentialStatus::HalfOpen));
    }

    #[tokio::test]
    async fn test_sweep_skips_disabled() {
        let (pool, id, opened) = open_pool().await;
        pool.disable(&id).unwrap();
        let monitor = RotationMonitor::new(pool.clone(), Duration::from_secs(30));

        let report = monitor.sweep_at(opened + ChronoDuration::days(1));
        assert!(report.changes.is_empty());
        assert_eq!(pool.status_of(&id), Some(CredentialStatus::Disabled));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let pool = Arc::new(CredentialPool::in_memory(PoolConfig::default()));
        let monitor = RotationMonitor::new(pool, Duration::from_millis(10));

        assert!(!monitor.is_running());
        assert!(monitor.start());
        assert!(!monitor.start());
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        // restartable after stop
        assert!(monitor.start());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_background_loop_persists_records() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let pool = Arc::new(CredentialPool::new(PoolConfig::default(), store.clone()));
        let id = pool
            .register(SecretString::new("sk-monitor-persist-key".into()))
            .await
            .unwrap();
        assert!(store.load_records().await.unwrap().is_empty());

        let monitor = RotationMonitor::new(pool, Duration::from_millis(10));
        monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;

        let records = store.load_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].status, "HEALTHY");
    }
}
