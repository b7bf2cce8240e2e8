//! Discovery Engine
//!
//! Per service name, maintains a locally cached, asynchronously refreshed
//! view of all registered instances, and selects one under a pluggable
//! strategy while quarantining instances callers report as failing.
//!
//! The cache is refreshed from the coordination store on change notifications
//! and on a periodic poll; every refresh applies as a total snapshot, so a
//! reader never observes a half-updated cache. Selection and error reporting
//! never touch the network.

use crate::config::{ConfigError, DiscoveryConfig};
use crate::error::DiscoveryError;
use crate::store::{self, CoordinationStore, StoreEvent};
use crate::strategy::{
    DownInstancePolicy, HealthState, InstanceHealth, RoundRobinStrategy, SelectionStrategy,
};
use beacon_core::{InstanceRecord, JsonRecordCodec, RecordCodec};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct CachedInstance {
    record: InstanceRecord,
    health: InstanceHealth,
}

struct EngineInner {
    config: DiscoveryConfig,
    store: Arc<dyn CoordinationStore>,
    codec: Arc<dyn RecordCodec>,
    strategy: Box<dyn SelectionStrategy>,
    policy: DownInstancePolicy,
    /// `None` while the engine is not started; swapped wholesale on refresh.
    cache: Mutex<Option<HashMap<Uuid, CachedInstance>>>,
    shutdown: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

/// Cheaply cloneable handle to one watched service's discovery state.
#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
}

impl DiscoveryEngine {
    /// Engine with round-robin selection and the default down-instance
    /// policy.
    pub fn new(
        config: DiscoveryConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<Self, ConfigError> {
        Self::with_parts(
            config,
            store,
            Arc::new(JsonRecordCodec),
            Box::new(RoundRobinStrategy::new()),
            DownInstancePolicy::default(),
        )
    }

    /// Engine with an explicit codec, selection strategy, and down-instance
    /// policy.
    pub fn with_parts(
        config: DiscoveryConfig,
        store: Arc<dyn CoordinationStore>,
        codec: Arc<dyn RecordCodec>,
        strategy: Box<dyn SelectionStrategy>,
        policy: DownInstancePolicy,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                codec,
                strategy,
                policy,
                cache: Mutex::new(None),
                shutdown: Mutex::new(None),
            }),
        })
    }

    /// The service name this engine watches.
    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    /// Populate the cache and begin the background refresh subscription.
    ///
    /// Blocks for the initial store round trip; a failure there is retryable
    /// and leaves the engine stopped.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let (shutdown_tx, shutdown_rx) = {
            let mut shutdown = self.inner.shutdown.lock().expect("engine lock poisoned");
            if shutdown.is_some() {
                warn!(service = %self.service_name(), "discovery engine already started");
                return Ok(());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *shutdown = Some(tx.clone());
            (tx, rx)
        };

        // Watch before the initial list: events raised during population are
        // buffered in the channel instead of missed.
        let prefix = self.inner.service_prefix();
        let watch_rx = match self.inner.store.watch(&prefix).await {
            Ok(rx) => rx,
            Err(e) => {
                *self.inner.shutdown.lock().expect("engine lock poisoned") = None;
                return Err(e.into());
            }
        };

        // Initial cache population
        let records = match self.inner.fetch_snapshot().await {
            Ok(records) => records,
            Err(e) => {
                *self.inner.shutdown.lock().expect("engine lock poisoned") = None;
                return Err(e);
            }
        };

        {
            let shutdown = self.inner.shutdown.lock().expect("engine lock poisoned");
            if shutdown.is_none() {
                // Stopped while the initial fetch was in flight
                return Ok(());
            }
            *self.inner.cache.lock().expect("engine lock poisoned") = Some(HashMap::new());
        }
        self.inner.apply_snapshot(records);

        drop(shutdown_tx);
        tokio::spawn(run_refresh(
            Arc::downgrade(&self.inner),
            shutdown_rx,
            watch_rx,
        ));
        info!(service = %self.service_name(), "discovery engine started");
        Ok(())
    }

    /// End the background subscription and release the cache. Subsequent
    /// `select_instance` calls fail with `NotStarted`. Never blocks on
    /// in-flight refreshes.
    pub fn stop(&self) {
        let sender = self
            .inner
            .shutdown
            .lock()
            .expect("engine lock poisoned")
            .take();
        if sender.is_none() {
            return;
        }
        // Dropping the sender wakes and ends the refresh task
        drop(sender);
        *self.inner.cache.lock().expect("engine lock poisoned") = None;
        info!(service = %self.service_name(), "discovery engine stopped");
    }

    /// Distinct service names currently registered anywhere in the store.
    /// Pure store read; requires no local state.
    pub async fn list_service_names(&self) -> Result<Vec<String>, DiscoveryError> {
        let base = self.inner.config.base_path.clone();
        let prefix = format!("{}/", base.trim_end_matches('/'));
        let entries = self.inner.store.list(&prefix).await?;

        let mut names = BTreeSet::new();
        for (path, _) in entries {
            if let Some((service, _)) = store::parse_instance_path(&base, &path) {
                names.insert(service.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Snapshot of all cached records for the watched service, regardless of
    /// health state. Reflects the most recent refresh.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, DiscoveryError> {
        let cache = self.inner.cache.lock().expect("engine lock poisoned");
        let cache = cache.as_ref().ok_or(DiscoveryError::NotStarted)?;
        Ok(cache.values().map(|entry| entry.record.clone()).collect())
    }

    /// Pick one instance among the currently Up set via the configured
    /// strategy. Operates on the cache snapshot only; never blocks on a store
    /// read.
    pub fn select_instance(&self) -> Result<InstanceRecord, DiscoveryError> {
        let mut guard = self.inner.cache.lock().expect("engine lock poisoned");
        let cache = guard.as_mut().ok_or(DiscoveryError::NotStarted)?;

        let mut up: Vec<InstanceRecord> = cache
            .values_mut()
            .filter_map(|entry| {
                (entry.health.state(&self.inner.policy) == HealthState::Up)
                    .then(|| entry.record.clone())
            })
            .collect();
        // Ascending instance id keeps position-based strategies deterministic
        up.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        self.inner
            .strategy
            .select(&up)
            .cloned()
            .ok_or_else(|| DiscoveryError::NoInstancesAvailable {
                service: self.inner.config.service_name.clone(),
            })
    }

    /// Report a failed interaction with a previously selected instance.
    /// Purely local; once the down-instance policy's threshold is exceeded
    /// the instance is excluded from selection until the recovery timeout.
    pub fn note_error(&self, record: &InstanceRecord) {
        let mut guard = self.inner.cache.lock().expect("engine lock poisoned");
        let Some(cache) = guard.as_mut() else { return };
        let Some(entry) = cache.get_mut(&record.instance_id) else {
            // Already removed by a refresh; nothing to quarantine
            return;
        };
        entry.health.note_error(&self.inner.policy);
        if entry.health.state(&self.inner.policy) == HealthState::Down {
            debug!(
                service = %record.service_name,
                instance_id = %record.instance_id,
                "instance marked down"
            );
        }
    }
}

impl EngineInner {
    fn service_prefix(&self) -> String {
        store::service_prefix(&self.config.base_path, &self.config.service_name)
    }

    /// Fetch and decode all records for the watched service. Malformed
    /// entries are skipped and logged, never fatal to the whole cache.
    async fn fetch_snapshot(&self) -> Result<Vec<InstanceRecord>, DiscoveryError> {
        let entries = self.store.list(&self.service_prefix()).await?;

        let mut records = Vec::with_capacity(entries.len());
        for (path, bytes) in entries {
            match self.codec.decode(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path, error = %e, "skipping malformed instance record");
                }
            }
        }
        Ok(records)
    }

    /// Replace the cache with a total snapshot. Health state carries over for
    /// surviving ids; ids absent from the refresh are removed.
    fn apply_snapshot(&self, records: Vec<InstanceRecord>) {
        let mut guard = self.cache.lock().expect("engine lock poisoned");
        let Some(cache) = guard.as_mut() else { return };

        let mut next = HashMap::with_capacity(records.len());
        for record in records {
            let health = cache
                .remove(&record.instance_id)
                .map(|entry| entry.health)
                .unwrap_or_else(InstanceHealth::new);
            next.insert(record.instance_id, CachedInstance { record, health });
        }
        *cache = next;
        debug!(
            service = %self.config.service_name,
            instance_count = cache.len(),
            "instance cache refreshed"
        );
    }

    async fn refresh(&self) {
        match self.fetch_snapshot().await {
            Ok(records) => self.apply_snapshot(records),
            Err(e) => {
                warn!(
                    service = %self.config.service_name,
                    error = %e,
                    "cache refresh failed, will retry on next trigger"
                );
            }
        }
    }
}

/// Background refresh subscription: watch events and a periodic poll both
/// trigger a full re-list. A failed watch stream is re-established after the
/// configured delay (the poll keeps the cache fresh in the meantime).
async fn run_refresh(
    inner: Weak<EngineInner>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
    mut watch_rx: mpsc::Receiver<StoreEvent>,
) {
    let (prefix, refresh_interval, reconnect_delay) = match inner.upgrade() {
        Some(inner) => (
            inner.service_prefix(),
            inner.config.refresh_interval,
            inner.config.watch_reconnect_delay,
        ),
        None => return,
    };

    let mut interval = tokio::time::interval(refresh_interval);
    interval.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("refresh task shutting down");
                return;
            }
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { return };
                inner.refresh().await;
            }
            event = watch_rx.recv() => {
                match event {
                    Some(_) => {
                        // Coalesce bursts of change events into one refresh
                        while watch_rx.try_recv().is_ok() {}
                        let Some(inner) = inner.upgrade() else { return };
                        inner.refresh().await;
                    }
                    None => {
                        warn!("watch stream lost, re-establishing");
                        watch_rx = match establish_watch(
                            &inner,
                            &prefix,
                            &mut shutdown_rx,
                            reconnect_delay,
                        )
                        .await
                        {
                            Some(rx) => rx,
                            None => return,
                        };
                        let Some(inner) = inner.upgrade() else { return };
                        inner.refresh().await;
                    }
                }
            }
        }
    }
}

/// Open the change-event stream, retrying with the reconnect delay until it
/// succeeds or shutdown is requested. Returns `None` on shutdown.
async fn establish_watch(
    inner: &Weak<EngineInner>,
    prefix: &str,
    shutdown_rx: &mut mpsc::UnboundedReceiver<()>,
    initial_delay: std::time::Duration,
) -> Option<mpsc::Receiver<StoreEvent>> {
    tokio::select! {
        _ = shutdown_rx.recv() => return None,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    loop {
        let strong = inner.upgrade()?;
        let delay = strong.config.watch_reconnect_delay;
        tokio::select! {
            _ = shutdown_rx.recv() => return None,
            result = strong.store.watch(prefix) => {
                match result {
                    Ok(rx) => {
                        debug!(prefix, "watch stream established");
                        return Some(rx);
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to establish watch stream, retrying");
                    }
                }
            }
        }
        drop(strong);
        tokio::select! {
            _ = shutdown_rx.recv() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config(service: &str) -> DiscoveryConfig {
        let mut config = DiscoveryConfig::for_service(service);
        // Keep the poll out of the way; tests drive refreshes via watches
        config.refresh_interval = Duration::from_secs(300);
        config.watch_reconnect_delay = Duration::from_millis(20);
        config
    }

    fn record(service: &str, port: u16) -> InstanceRecord {
        InstanceRecord::new(Uuid::new_v4(), service, "10.0.0.5", port)
    }

    async fn put_record(store: &MemoryStore, base: &str, record: &InstanceRecord) {
        let path = store::instance_path(base, &record.service_name, &record.instance_id.to_string());
        store
            .put(&path, JsonRecordCodec.encode(record).unwrap())
            .await
            .unwrap();
    }

    async fn engine_with(
        store: &MemoryStore,
        service: &str,
        policy: DownInstancePolicy,
    ) -> DiscoveryEngine {
        let engine = DiscoveryEngine::with_parts(
            config(service),
            Arc::new(store.clone()),
            Arc::new(JsonRecordCodec),
            Box::new(RoundRobinStrategy::new()),
            policy,
        )
        .unwrap();
        engine.start().await.unwrap();
        engine
    }

    async fn wait_for_instance_count(engine: &DiscoveryEngine, count: usize) {
        for _ in 0..200 {
            if engine.list_instances().unwrap().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "cache never reached {count} instances, has {}",
            engine.list_instances().unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_select_before_start_fails() {
        let store = MemoryStore::new();
        let engine =
            DiscoveryEngine::new(config("payments"), Arc::new(store.clone())).unwrap();
        assert!(matches!(
            engine.select_instance(),
            Err(DiscoveryError::NotStarted)
        ));
        assert!(matches!(
            engine.list_instances(),
            Err(DiscoveryError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_releases_cache() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        put_record(&store, &base, &record("payments", 9090)).await;

        let engine = engine_with(&store, "payments", DownInstancePolicy::default()).await;
        assert!(engine.select_instance().is_ok());

        engine.stop();
        assert!(matches!(
            engine.select_instance(),
            Err(DiscoveryError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_register_refresh_unregister_scenario() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        let registered = record("payments", 9090);
        put_record(&store, &base, &registered).await;

        let engine = engine_with(&store, "payments", DownInstancePolicy::default()).await;
        let instances = engine.list_instances().unwrap();
        assert_eq!(instances, vec![registered.clone()]);

        let path = store::instance_path(
            &base,
            &registered.service_name,
            &registered.instance_id.to_string(),
        );
        store.delete(&path).await.unwrap();
        wait_for_instance_count(&engine, 0).await;

        assert!(matches!(
            engine.select_instance(),
            Err(DiscoveryError::NoInstancesAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_watch_picks_up_new_instances() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        put_record(&store, &base, &record("payments", 9090)).await;

        let engine = engine_with(&store, "payments", DownInstancePolicy::default()).await;
        wait_for_instance_count(&engine, 1).await;

        put_record(&store, &base, &record("payments", 9091)).await;
        wait_for_instance_count(&engine, 2).await;
    }

    #[tokio::test]
    async fn test_round_robin_spreads_selection() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        for port in [9090, 9091, 9092] {
            put_record(&store, &base, &record("payments", port)).await;
        }

        let engine = engine_with(&store, "payments", DownInstancePolicy::default()).await;

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        let mut last: Option<Uuid> = None;
        for _ in 0..9 {
            let picked = engine.select_instance().unwrap();
            assert_ne!(last, Some(picked.instance_id));
            last = Some(picked.instance_id);
            *counts.entry(picked.instance_id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, 3);
        }
    }

    #[tokio::test]
    async fn test_note_error_quarantines_until_recovery() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        let flaky = record("payments", 9090);
        let steady = record("payments", 9091);
        put_record(&store, &base, &flaky).await;
        put_record(&store, &base, &steady).await;

        let policy = DownInstancePolicy {
            error_threshold: 2,
            window: Duration::from_secs(30),
            recovery: Duration::from_millis(60),
        };
        let engine = engine_with(&store, "payments", policy).await;

        engine.note_error(&flaky);
        engine.note_error(&flaky);

        for _ in 0..10 {
            assert_eq!(engine.select_instance().unwrap().instance_id, steady.instance_id);
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        let seen: BTreeSet<Uuid> = (0..10)
            .map(|_| engine.select_instance().unwrap().instance_id)
            .collect();
        assert!(seen.contains(&flaky.instance_id), "instance never re-admitted");
    }

    #[tokio::test]
    async fn test_all_down_yields_no_instances() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        let only = record("payments", 9090);
        put_record(&store, &base, &only).await;

        let policy = DownInstancePolicy {
            error_threshold: 1,
            window: Duration::from_secs(30),
            recovery: Duration::from_secs(30),
        };
        let engine = engine_with(&store, "payments", policy).await;

        engine.note_error(&only);
        assert!(matches!(
            engine.select_instance(),
            Err(DiscoveryError::NoInstancesAvailable { .. })
        ));
        // Down instances still show in the unfiltered listing
        assert_eq!(engine.list_instances().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        put_record(&store, &base, &record("payments", 9090)).await;
        store
            .put(
                &store::instance_path(&base, "payments", "garbage"),
                b"not a record".to_vec(),
            )
            .await
            .unwrap();

        let engine = engine_with(&store, "payments", DownInstancePolicy::default()).await;
        assert_eq!(engine.list_instances().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_service_names() {
        let store = MemoryStore::new();
        let base = config("payments").base_path;
        put_record(&store, &base, &record("payments", 9090)).await;
        put_record(&store, &base, &record("billing", 9091)).await;

        let engine =
            DiscoveryEngine::new(config("payments"), Arc::new(store.clone())).unwrap();
        let names = engine.list_service_names().await.unwrap();
        assert_eq!(names, vec!["billing".to_string(), "payments".to_string()]);
    }
}
