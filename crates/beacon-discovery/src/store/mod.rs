//! Coordination Store Abstraction
//!
//! The external session-based store both components read and write but never
//! assume synchronously consistent without a fresh round trip. Records written
//! through [`CoordinationStore::put`] are ephemeral: the store drops them when
//! the writer's session ends.
//!
//! Paths are namespaced as `<base_path>/<service_name>/<instance_id>`.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Transport-level failures talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store connection closed")]
    Closed,
}

/// A change to a watched path prefix.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Put { path: String, bytes: Vec<u8> },
    Delete { path: String },
}

/// Session-state transitions reported by the store client.
///
/// `Reconnected` means the session was re-established after an interruption;
/// ephemeral records written under the old session may have been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Suspended,
    Reconnected,
}

/// Consumed store primitives: ephemeral keyed records, prefix listing,
/// change notifications, and session-state notifications.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Write an ephemeral record bound to the current session.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a record. Deleting an absent path succeeds.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// List all records under a path prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Open a change-event stream for a path prefix. The stream ends when the
    /// underlying watch fails; callers re-establish it.
    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<StoreEvent>, StoreError>;

    /// Subscribe to session-state transitions.
    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;

    /// Connectivity probe for health reporting.
    async fn check(&self) -> Result<(), StoreError>;
}

/// Full path for one instance record.
pub fn instance_path(base_path: &str, service_name: &str, instance_id: &str) -> String {
    format!(
        "{}/{}/{}",
        base_path.trim_end_matches('/'),
        service_name,
        instance_id
    )
}

/// Prefix covering all instances of one service.
pub fn service_prefix(base_path: &str, service_name: &str) -> String {
    format!("{}/{}/", base_path.trim_end_matches('/'), service_name)
}

/// Split a full record path into (service_name, instance_id).
pub fn parse_instance_path<'a>(base_path: &str, path: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = path
        .strip_prefix(base_path.trim_end_matches('/'))?
        .strip_prefix('/')?;
    let (service, id) = rest.split_once('/')?;
    if service.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    Some((service, id))
}
