//! Services module
//!
//! Contains the credential pool, its background monitor, and the forwarding
//! engine with its upstream client.

pub mod classifier;
pub mod credential_pool;
pub mod forwarder;
pub mod rotation_monitor;
pub mod upstream;

pub use classifier::{Classification, ClassificationPolicy};
pub use credential_pool::{
    CredentialId, CredentialPool, CredentialSnapshot, CredentialStatus, CredentialStore,
    FileCredentialStore, HealthPolicy, InMemoryCredentialStore, Lease, Outcome, PoolConfig,
    PoolError, PoolHealthSummary,
};
pub use forwarder::{
    AttemptFailure, BodyStream, ForwardError, ForwarderConfig, ForwardingEngine, NonRetryable,
    UpstreamBody, UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse,
};
pub use rotation_monitor::{RotationMonitor, SweepReport};
pub use upstream::HttpUpstream;
