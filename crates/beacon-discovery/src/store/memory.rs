//! In-process coordination store.
//!
//! Implements the same ephemeral-record and session semantics as the etcd
//! store, entirely in memory. Used by unit tests and local demos: the session
//! can be interrupted and restored on demand, which drops every ephemeral
//! record exactly like a real store expiring a session.

use super::{CoordinationStore, SessionEvent, StoreError, StoreEvent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

const WATCH_BUFFER: usize = 64;

struct WatcherEntry {
    prefix: String,
    tx: mpsc::Sender<StoreEvent>,
}

struct MemoryInner {
    entries: BTreeMap<String, Vec<u8>>,
    watchers: Vec<WatcherEntry>,
    session_up: bool,
}

/// In-memory [`CoordinationStore`] with controllable session state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (session_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                entries: BTreeMap::new(),
                watchers: Vec::new(),
                session_up: true,
            })),
            session_tx,
        }
    }

    /// Simulate a session interruption: every ephemeral record is dropped and
    /// `SessionEvent::Suspended` is broadcast.
    pub fn interrupt_session(&self) {
        let dropped: Vec<String> = {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            inner.session_up = false;
            let dropped: Vec<String> = inner.entries.keys().cloned().collect();
            inner.entries.clear();
            for path in &dropped {
                notify(&mut inner.watchers, StoreEvent::Delete { path: path.clone() });
            }
            dropped
        };
        debug!(dropped = dropped.len(), "memory store session interrupted");
        let _ = self.session_tx.send(SessionEvent::Suspended);
    }

    /// Simulate session re-establishment and broadcast
    /// `SessionEvent::Reconnected`.
    pub fn restore_session(&self) {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .session_up = true;
        debug!("memory store session restored");
        let _ = self.session_tx.send(SessionEvent::Reconnected);
    }

    /// Number of live records, across all services.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn notify(watchers: &mut Vec<WatcherEntry>, event: StoreEvent) {
    watchers.retain(|watcher| {
        let path = match &event {
            StoreEvent::Put { path, .. } => path,
            StoreEvent::Delete { path } => path,
        };
        if !path.starts_with(&watcher.prefix) {
            return true;
        }
        match watcher.tx.try_send(event.clone()) {
            Ok(()) => true,
            // A full buffer drops the event, not the watch; consumers
            // reconcile with a fresh list on their next refresh
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    });
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if !inner.session_up {
            return Err(StoreError::Unavailable("session interrupted".to_string()));
        }
        inner.entries.insert(path.to_string(), bytes.clone());
        notify(
            &mut inner.watchers,
            StoreEvent::Put {
                path: path.to_string(),
                bytes,
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if !inner.session_up {
            return Err(StoreError::Unavailable("session interrupted".to_string()));
        }
        // Delete-of-absent is a no-op success
        if inner.entries.remove(path).is_some() {
            notify(
                &mut inner.watchers,
                StoreEvent::Delete {
                    path: path.to_string(),
                },
            );
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        if !inner.session_up {
            return Err(StoreError::Unavailable("session interrupted".to_string()));
        }
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, bytes)| (path.clone(), bytes.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<StoreEvent>, StoreError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .watchers
            .push(WatcherEntry {
                prefix: prefix.to_string(),
                tx,
            });
        Ok(rx)
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    async fn check(&self) -> Result<(), StoreError> {
        if self.inner.lock().expect("memory store lock poisoned").session_up {
            Ok(())
        } else {
            Err(StoreError::Unavailable("session interrupted".to_string()))
        }
    }
}
