//! Etcd-backed coordination store.
//!
//! Leases model ephemerality: every record is written under the current
//! session lease and the store drops it when the lease expires. A background
//! task keeps the lease alive; on keep-alive failure the session is reported
//! `Suspended`, a fresh lease is granted with backoff, and `Reconnected` is
//! broadcast so advertisers can re-register records the old lease lost.

use super::{CoordinationStore, SessionEvent, StoreError, StoreEvent};
use crate::config::DiscoveryConfig;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace, warn};

const WATCH_BUFFER: usize = 64;

/// Etcd implementation of [`CoordinationStore`].
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    /// Current session lease id; 0 while the session is suspended.
    lease_id: Arc<AtomicI64>,
    session_tx: broadcast::Sender<SessionEvent>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    operation_timeout: Duration,
}

impl EtcdStore {
    /// Connect to the configured quorum with exponential backoff, grant the
    /// session lease, and start the keep-alive task.
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self, StoreError> {
        let backoff = ExponentialBackoff {
            initial_interval: config.backoff_initial,
            max_interval: config.backoff_max,
            max_elapsed_time: Some(config.backoff_max_elapsed),
            multiplier: config.backoff_multiplier,
            ..Default::default()
        };

        let endpoints = config.endpoints();
        let max_retries = config.max_retries;
        let failures = AtomicU32::new(0);
        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!("connected to coordination store");
                    Ok(client)
                }
                Err(e) => {
                    // The initial attempt plus max_retries retries
                    let attempt = failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if attempt > max_retries {
                        warn!(error = %e, attempt, "store connection failed, giving up");
                        Err(backoff::Error::permanent(e))
                    } else {
                        warn!(error = %e, attempt, "store connection failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("connect failed after retries: {e}")))?;

        let lease_resp = client
            .clone()
            .lease_grant(config.session_ttl, None)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let lease_id = Arc::new(AtomicI64::new(lease_resp.id()));
        debug!(
            lease_id = lease_resp.id(),
            ttl = config.session_ttl,
            "session lease granted"
        );

        let (session_tx, _) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_session(
            client.clone(),
            Arc::clone(&lease_id),
            session_tx.clone(),
            shutdown_rx,
            config.session_ttl,
            config.keepalive_interval,
            config.backoff_initial,
        ));

        let _ = session_tx.send(SessionEvent::Connected);

        Ok(Self {
            client,
            lease_id,
            session_tx,
            shutdown_tx,
            operation_timeout: config.operation_timeout,
        })
    }

    /// Gracefully end the session: stop keep-alive and revoke the lease so
    /// other peers see the DELETE events promptly instead of waiting out the
    /// TTL.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let lease_id = self.lease_id.swap(0, Ordering::AcqRel);
        if lease_id != 0 {
            match self.client.clone().lease_revoke(lease_id).await {
                Ok(_) => debug!(lease_id, "session lease revoked"),
                Err(e) => warn!(lease_id, error = %e, "failed to revoke session lease"),
            }
        }
    }

    fn current_lease(&self) -> Result<i64, StoreError> {
        match self.lease_id.load(Ordering::Acquire) {
            0 => Err(StoreError::Unavailable("session suspended".to_string())),
            id => Ok(id),
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout(self.operation_timeout)),
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let lease_id = self.current_lease()?;
        let options = PutOptions::new().with_lease(lease_id);
        let mut client = self.client.clone();
        self.with_timeout(client.put(path, bytes, Some(options)))
            .await?;
        trace!(path, lease_id, "record written");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        // Delete of an absent key is a successful zero-key delete in etcd
        self.with_timeout(client.delete(path, None)).await?;
        trace!(path, "record deleted");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix();
        let resp = self.with_timeout(client.get(prefix, Some(options))).await?;

        let mut records = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match kv.key_str() {
                Ok(path) => records.push((path.to_string(), kv.value().to_vec())),
                Err(e) => warn!(error = %e, "non-utf8 key in store, skipping"),
            }
        }
        Ok(records)
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<StoreEvent>, StoreError> {
        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prefix();
        let (watcher, mut stream) = self
            .with_timeout(client.watch(prefix, Some(options)))
            .await?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            // The watcher cancels the server-side watch on drop; keep it
            // alive for the lifetime of the forwarding loop.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!("watch stream canceled by store");
                            break;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let path = match kv.key_str() {
                                Ok(path) => path.to_string(),
                                Err(e) => {
                                    warn!(error = %e, "non-utf8 key in watch event, skipping");
                                    continue;
                                }
                            };
                            let out = match event.event_type() {
                                EventType::Put => StoreEvent::Put {
                                    path,
                                    bytes: kv.value().to_vec(),
                                },
                                EventType::Delete => StoreEvent::Delete { path },
                            };
                            if tx.send(out).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "watch stream failed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    async fn check(&self) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        self.with_timeout(client.status()).await?;
        self.current_lease()?;
        Ok(())
    }
}

/// Session keep-alive loop.
///
/// Sends periodic keep-alive requests for the current lease. On failure the
/// session is reported `Suspended` and a new lease is granted with backoff;
/// once granted, `Reconnected` is broadcast. Exits on shutdown signal.
async fn run_session(
    client: Client,
    lease_id: Arc<AtomicI64>,
    session_tx: broadcast::Sender<SessionEvent>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
    session_ttl: i64,
    keepalive_interval: Duration,
    regrant_delay: Duration,
) {
    let current = lease_id.load(Ordering::Acquire);
    let (mut keeper, mut stream) = match client.clone().lease_keep_alive(current).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(lease_id = current, error = %e, "failed to open keep-alive stream");
            lease_id.store(0, Ordering::Release);
            let _ = session_tx.send(SessionEvent::Suspended);
            return;
        }
    };

    let mut interval = tokio::time::interval(keepalive_interval);
    interval.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("session keep-alive task shutting down");
                return;
            }
            _ = interval.tick() => {
                let alive = match keeper.keep_alive().await {
                    Ok(()) => match stream.message().await {
                        Ok(Some(resp)) if resp.ttl() > 0 => {
                            trace!(ttl = resp.ttl(), "keep-alive OK");
                            true
                        }
                        Ok(Some(_)) => {
                            warn!("lease expired on the store side");
                            false
                        }
                        Ok(None) => {
                            warn!("keep-alive stream closed");
                            false
                        }
                        Err(e) => {
                            warn!(error = %e, "keep-alive failed");
                            false
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "keep-alive send failed");
                        false
                    }
                };

                if alive {
                    continue;
                }

                lease_id.store(0, Ordering::Release);
                let _ = session_tx.send(SessionEvent::Suspended);

                // Re-establish the session: grant a fresh lease, then a fresh
                // keep-alive stream. The old lease's records are gone; the
                // Reconnected event tells advertisers to re-register.
                loop {
                    let mut grant_client = client.clone();
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            debug!("session keep-alive task shutting down during regrant");
                            return;
                        }
                        result = grant_client.lease_grant(session_ttl, None) => {
                            match result {
                                Ok(resp) => {
                                    match client.clone().lease_keep_alive(resp.id()).await {
                                        Ok(pair) => {
                                            (keeper, stream) = pair;
                                            lease_id.store(resp.id(), Ordering::Release);
                                            debug!(lease_id = resp.id(), "session re-established");
                                            let _ = session_tx.send(SessionEvent::Reconnected);
                                            break;
                                        }
                                        Err(e) => {
                                            warn!(error = %e, "keep-alive stream re-open failed, retrying");
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "lease regrant failed, retrying");
                                }
                            }
                            tokio::time::sleep(regrant_delay).await;
                        }
                    }
                }
            }
        }
    }
}
