//! Error taxonomy for advertisement and discovery.

use crate::store::StoreError;
use beacon_core::{CodecError, RecordError};
use thiserror::Error;

/// Errors surfaced by the [`Advertiser`](crate::Advertiser) and
/// [`DiscoveryEngine`](crate::DiscoveryEngine).
///
/// `NotInitialized` and `NotStarted` are programmer errors and are never
/// retried. `StoreUnavailable` is retryable by the caller or by the automatic
/// reconnect path. `NoInstancesAvailable` is the expected "scale up the
/// target service" condition, distinct from infrastructure failures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Registration or unregistration attempted before `init_listen_info`.
    #[error("advertiser not initialized: listen address/port not set")]
    NotInitialized,

    /// Selection attempted on an engine that was stopped or never started.
    #[error("discovery engine not started")]
    NotStarted,

    /// Network or timeout failure talking to the coordination store.
    #[error("coordination store unavailable")]
    StoreUnavailable(#[from] StoreError),

    /// The Up set for the watched service is empty.
    #[error("no instances available for service {service:?}")]
    NoInstancesAvailable { service: String },

    /// A stored record could not be decoded.
    #[error(transparent)]
    Decode(#[from] CodecError),

    /// The local instance record failed validation before registration.
    #[error("invalid instance record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// Write attempted while the client is configured read-only.
    #[error("coordination client is configured read-only")]
    ReadOnly,
}

impl DiscoveryError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::StoreUnavailable(_) | DiscoveryError::NoInstancesAvailable { .. }
        )
    }
}
