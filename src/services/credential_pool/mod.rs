//! Credential Pool Module
//!
//! Manages the upstream credentials the gateway rotates through, each guarded
//! by its own circuit breaker.
//!
//! # Features
//! - Weighted least-recently-used selection with a half-open trial quota
//! - Five-state circuit breaker (HEALTHY, DEGRADED, OPEN, HALF_OPEN, DISABLED)
//! - Per-credential locking; no pool-wide lock on the request path
//! - Secrets kept in a pluggable `CredentialStore`, never in pool state
//! - Optional JSON file store so health survives a restart
//!
//! # Example
//! ```ignore
//! use credential_gateway::services::credential_pool::{CredentialPool, Outcome, PoolConfig};
//!
//! let pool = CredentialPool::in_memory(PoolConfig::default());
//! let id = pool.register(SecretString::new("sk-...".into())).await?;
//!
//! let lease = pool.select()?;
//! let secret = pool.secret_for(lease.id()).await?;
//! // ... call upstream with `secret` ...
//! pool.settle(lease, Outcome::Success)?;
//! ```

mod credential;
mod error;
mod file_store;
mod health;
mod pool;
mod store;
mod strategy;

pub use credential::{
    CredentialId, CredentialRecord, CredentialSnapshot, CredentialStatus, Outcome,
    PoolHealthSummary, UnknownStatus,
};
pub use error::PoolError;
pub use file_store::FileCredentialStore;
pub use health::{HealthPolicy, StatusChange};
pub use pool::{CredentialPool, Lease, PoolConfig};
pub use store::{CredentialStore, InMemoryCredentialStore, StoreError};
