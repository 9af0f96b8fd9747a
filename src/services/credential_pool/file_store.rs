//! File-backed credential store
//!
//! Secrets and health records live in one JSON document. Every mutation
//! rewrites the document through a temp file and a rename, so a crash leaves
//! either the previous or the new document on disk, never a torn one.

use super::credential::{CredentialId, CredentialRecord};
use super::store::{CredentialStore, StoreError};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Document as read back from disk
#[derive(Default, Deserialize)]
struct StoredDocument {
    #[serde(default)]
    secrets: BTreeMap<CredentialId, String>,
    #[serde(default)]
    records: Vec<CredentialRecord>,
}

/// Document as written, borrowing from the live state
#[derive(Serialize)]
struct DocumentRef<'a> {
    secrets: BTreeMap<&'a CredentialId, &'a str>,
    records: Vec<&'a CredentialRecord>,
}

#[derive(Default)]
struct StoreState {
    secrets: HashMap<CredentialId, SecretString>,
    records: BTreeMap<CredentialId, CredentialRecord>,
}

impl From<StoredDocument> for StoreState {
    fn from(doc: StoredDocument) -> Self {
        Self {
            secrets: doc
                .secrets
                .into_iter()
                .map(|(id, secret)| (id, SecretString::new(secret.into())))
                .collect(),
            records: doc
                .records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }
}

/// Durable store kept in a single JSON file
///
/// The whole document is cached in memory; reads never touch the disk.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileCredentialStore {
    /// Open the store at `path`, starting empty when the file does not exist yet
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let state = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let doc: StoredDocument = serde_json::from_slice(&raw)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
                StoreState::from(doc)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(unavailable(&path, e)),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(parent, e))?;
        }

        tracing::info!(
            path = %path.display(),
            secrets = state.secrets.len(),
            records = state.records.len(),
            "Credential store opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_document(&self, state: &StoreState) -> Result<(), StoreError> {
        let doc = DocumentRef {
            secrets: state
                .secrets
                .iter()
                .map(|(id, secret)| (id, secret.expose_secret()))
                .collect(),
            records: state.records.values().collect(),
        };
        let json = serde_json::to_vec_pretty(&doc).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(|e| unavailable(&temp_path, e))?;
        restrict_permissions(&temp_path).await?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| unavailable(&self.path, e))?;

        tracing::trace!(path = %self.path.display(), bytes = json.len(), "Credential store written");
        Ok(())
    }
}

fn unavailable(path: &Path, err: io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", path.display(), err))
}

/// Secrets are stored in clear text; keep the file owner-only
#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| unavailable(path, e))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn put_secret(&self, id: &CredentialId, secret: SecretString) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.secrets.insert(id.clone(), secret);
        self.write_document(&state).await
    }

    async fn fetch_secret(&self, id: &CredentialId) -> Result<Option<SecretString>, StoreError> {
        Ok(self.state.lock().await.secrets.get(id).cloned())
    }

    async fn delete(&self, id: &CredentialId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let had_secret = state.secrets.remove(id).is_some();
        let had_record = state.records.remove(id).is_some();
        if had_secret || had_record {
            self.write_document(&state).await?;
        }
        Ok(())
    }

    async fn save_records(&self, records: Vec<CredentialRecord>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.records = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        self.write_document(&state).await
    }

    async fn load_records(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        Ok(self.state.lock().await.records.values().cloned().collect())
    }
}
