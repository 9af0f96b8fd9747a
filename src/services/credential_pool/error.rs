//! Credential pool errors

use super::credential::CredentialId;
use super::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No eligible credential in pool")]
    PoolExhausted,

    #[error("Unknown credential: {}", .0.short())]
    UnknownCredential(CredentialId),

    #[error("Invalid status '{value}' for credential {}", .id.short())]
    InvalidStatus { id: CredentialId, value: String },

    #[error("Credential secret must not be empty")]
    EmptySecret,

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),
}
