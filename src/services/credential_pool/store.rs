//! Credential store collaborator
//!
//! Holds the raw secrets (keyed by credential id) and the persisted health
//! records. The pool reads a secret only for the duration of one forwarding
//! attempt and never caches it.

use super::credential::{CredentialId, CredentialRecord};
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt store entry: {0}")]
    Corrupt(String),
}

/// Storage backend for secrets and credential records
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert or overwrite the secret for `id`
    async fn put_secret(&self, id: &CredentialId, secret: SecretString) -> Result<(), StoreError>;

    async fn fetch_secret(&self, id: &CredentialId) -> Result<Option<SecretString>, StoreError>;

    /// Remove both the secret and the record for `id`
    async fn delete(&self, id: &CredentialId) -> Result<(), StoreError>;

    /// Replace the full set of persisted records
    async fn save_records(&self, records: Vec<CredentialRecord>) -> Result<(), StoreError>;

    async fn load_records(&self) -> Result<Vec<CredentialRecord>, StoreError>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryCredentialStore {
    secrets: RwLock<HashMap<CredentialId, SecretString>>,
    records: RwLock<HashMap<CredentialId, CredentialRecord>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn put_secret(&self, id: &CredentialId, secret: SecretString) -> Result<(), StoreError> {
        self.secrets.write().await.insert(id.clone(), secret);
        Ok(())
    }

    async fn fetch_secret(&self, id: &CredentialId) -> Result<Option<SecretString>, StoreError> {
        Ok(self.secrets.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &CredentialId) -> Result<(), StoreError> {
        self.secrets.write().await.remove(id);
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn save_records(&self, records: Vec<CredentialRecord>) -> Result<(), StoreError> {
        let mut stored = self.records.write().await;
        stored.clear();
        stored.extend(records.into_iter().map(|record| (record.id.clone(), record)));
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
