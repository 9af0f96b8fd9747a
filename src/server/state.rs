//! Application state container
//!
//! Shared handles passed to every handler via axum state extraction.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::services::{
    CredentialPool, CredentialStore, FileCredentialStore, ForwardingEngine, HttpUpstream,
    InMemoryCredentialStore, RotationMonitor, UpstreamClient,
};

/// Shared application state
///
/// Cheap to clone. The pool is constructed once here and handed explicitly
/// to the forwarder and the monitor.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pool: Arc<CredentialPool>,
    pub forwarder: Arc<ForwardingEngine>,
    pub monitor: Arc<RotationMonitor>,
    pub start_time: Instant,
}

impl AppState {
    /// Build state with the reqwest upstream and the configured store
    ///
    /// `CREDENTIAL_STORE_PATH` selects the JSON file store; without it the
    /// store lives in memory and nothing survives a restart.
    pub async fn new(settings: Settings) -> Result<Self> {
        let upstream = HttpUpstream::new(
            settings.upstream.base_url.clone(),
            Duration::from_secs(settings.upstream.connect_timeout_secs),
            Duration::from_secs(settings.upstream.read_timeout_secs),
        )
        .context("Failed to build upstream HTTP client")?;

        tracing::debug!(base_url = %upstream.base_url(), "Upstream client ready");

        let store: Arc<dyn CredentialStore> = match &settings.credential_store_path {
            Some(path) => Arc::new(
                FileCredentialStore::open(path.clone())
                    .await
                    .with_context(|| format!("Failed to open credential store {}", path.display()))?,
            ),
            None => {
                tracing::warn!("CREDENTIAL_STORE_PATH not set; credential health will not survive a restart");
                Arc::new(InMemoryCredentialStore::new())
            }
        };

        Ok(Self::with_components(settings, store, Arc::new(upstream)))
    }

    /// Build state from explicit collaborators
    pub fn with_components(
        settings: Settings,
        store: Arc<dyn CredentialStore>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        let settings = Arc::new(settings);
        let pool = Arc::new(CredentialPool::new(settings.pool_config(), store));
        let forwarder = Arc::new(ForwardingEngine::new(
            pool.clone(),
            upstream,
            settings.classification_policy(),
            settings.forwarder_config(),
        ));
        let monitor = Arc::new(RotationMonitor::new(pool.clone(), settings.monitor_interval()));

        Self {
            settings,
            pool,
            forwarder,
            monitor,
            start_time: Instant::now(),
        }
    }

    /// Restore persisted health records, then register the configured keys
    ///
    /// Registration is idempotent, so keys already restored keep their state.
    pub async fn bootstrap(&self) -> Result<()> {
        let restored = self
            .pool
            .restore()
            .await
            .context("Failed to restore credential records")?;

        let mut registered = 0;
        for key in &self.settings.upstream.api_keys {
            let secret = SecretString::new(key.as_str().into());
            self.pool
                .register(secret)
                .await
                .context("Failed to register upstream credential")?;
            registered += 1;
        }

        let summary = self.pool.summary();
        tracing::info!(
            restored,
            registered,
            total = summary.total,
            healthy = summary.healthy_count,
            "Credential pool initialized"
        );
        if summary.total == 0 {
            tracing::warn!("Credential pool is empty; forwarding will fail until a credential is registered");
        }
        Ok(())
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
