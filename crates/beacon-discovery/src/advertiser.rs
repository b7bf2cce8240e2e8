//! Advertiser
//!
//! Owns the local instance's registration state: registers and unregisters
//! the instance record under the configured service name, and re-registers
//! automatically when the coordination session reconnects (the store drops
//! ephemeral records on session loss).
//!
//! `init_listen_info` is separate from `register_availability` because the
//! listening port is often only known after the network layer binds. The
//! built record is cached so reconnect-triggered re-registration advertises
//! the identical identity instead of minting a new `instance_id`.

use crate::config::{ConfigError, DiscoveryConfig};
use crate::error::DiscoveryError;
use crate::store::{self, CoordinationStore, SessionEvent};
use beacon_core::{InstanceRecord, JsonRecordCodec, RecordCodec};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Registration state machine, per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No listen info yet; registration calls fail fast.
    Uninitialized,
    /// Address and port resolved, nothing written to the store.
    Initialized,
    /// Record present in the store (as far as this process knows).
    Registered,
    /// Record deliberately removed.
    Unregistered,
}

struct AdvertiserState {
    phase: RegistrationState,
    listen_address: Option<String>,
    listen_port: u16,
    /// Built once, reused on re-registration so the advertised identity is
    /// stable. Cleared when listen info is overwritten by a re-bind.
    record: Option<InstanceRecord>,
    /// Desired state, tracked separately from the session-reported state so a
    /// deliberately withdrawn instance is not resurrected by a reconnect.
    want_registered: bool,
}

struct AdvertiserShared {
    config: DiscoveryConfig,
    store: Arc<dyn CoordinationStore>,
    codec: Arc<dyn RecordCodec>,
    instance_id: Uuid,
    state: Mutex<AdvertiserState>,
}

/// Cheaply cloneable handle to the per-process advertiser.
#[derive(Clone)]
pub struct Advertiser {
    shared: Arc<AdvertiserShared>,
}

impl Advertiser {
    /// Create an advertiser with a fresh `instance_id` and the default JSON
    /// codec, and subscribe it to session-state transitions.
    pub fn new(
        config: DiscoveryConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<Self, ConfigError> {
        Self::with_parts(config, store, Arc::new(JsonRecordCodec), Uuid::new_v4())
    }

    /// Fully injected constructor, mainly for tests.
    pub fn with_parts(
        config: DiscoveryConfig,
        store: Arc<dyn CoordinationStore>,
        codec: Arc<dyn RecordCodec>,
        instance_id: Uuid,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Arc::new(AdvertiserShared {
            config,
            store,
            codec,
            instance_id,
            state: Mutex::new(AdvertiserState {
                phase: RegistrationState::Uninitialized,
                listen_address: None,
                listen_port: 0,
                record: None,
                want_registered: false,
            }),
        });

        spawn_reconnect_task(&shared);
        Ok(Self { shared })
    }

    /// The per-process unique instance identifier, stable for the lifetime of
    /// this advertiser.
    pub fn instance_id(&self) -> Uuid {
        self.shared.instance_id
    }

    pub async fn registration_state(&self) -> RegistrationState {
        self.shared.state.lock().await.phase
    }

    /// Resolve the advertised address and store the listening port.
    ///
    /// Must be called before registration. Calling it again overwrites the
    /// listen info (re-bind); the `instance_id` never changes.
    pub async fn init_listen_info(&self, port: u16) {
        let address = resolve_listen_address(&self.shared.config.listen_address);
        let mut state = self.shared.state.lock().await;
        state.listen_address = Some(address);
        state.listen_port = port;
        // The cached record no longer matches the listen info
        state.record = None;
        if state.phase == RegistrationState::Uninitialized {
            state.phase = RegistrationState::Initialized;
        }
    }

    /// Write the instance record to the coordination store.
    pub async fn register_availability(&self) -> Result<(), DiscoveryError> {
        self.shared.register().await
    }

    /// Delete the instance record from the coordination store. Idempotent:
    /// unregistering an already-unregistered instance is a no-op success.
    pub async fn unregister_availability(&self) -> Result<(), DiscoveryError> {
        self.shared.unregister().await
    }
}

impl AdvertiserShared {
    fn record_path(&self, record: &InstanceRecord) -> String {
        store::instance_path(
            &self.config.base_path,
            &record.service_name,
            &record.instance_id.to_string(),
        )
    }

    /// Build the record on first use; reuse it afterwards so re-registration
    /// advertises the same identity.
    fn current_record(&self, state: &mut AdvertiserState) -> Result<InstanceRecord, DiscoveryError> {
        if state.phase == RegistrationState::Uninitialized || state.listen_port < 1 {
            return Err(DiscoveryError::NotInitialized);
        }
        if let Some(record) = &state.record {
            return Ok(record.clone());
        }
        let record = InstanceRecord::new(
            self.instance_id,
            self.config.service_name.clone(),
            state.listen_address.clone().unwrap_or_default(),
            state.listen_port,
        );
        record.validate()?;
        state.record = Some(record.clone());
        Ok(record)
    }

    async fn register(&self) -> Result<(), DiscoveryError> {
        if self.config.read_only {
            return Err(DiscoveryError::ReadOnly);
        }

        // The lock is held across the store round trip: registrations and
        // unregistrations for this instance apply in call order.
        let mut state = self.state.lock().await;
        self.register_locked(&mut state).await
    }

    /// Re-registration for the reconnect path. The desired-state check and
    /// the store write share one lock acquisition, so a concurrent direct
    /// unregistration cannot be overturned between them. Returns whether a
    /// record was written.
    async fn register_if_wanted(&self) -> Result<bool, DiscoveryError> {
        let mut state = self.state.lock().await;
        if !state.want_registered {
            return Ok(false);
        }
        self.register_locked(&mut state).await?;
        Ok(true)
    }

    async fn register_locked(&self, state: &mut AdvertiserState) -> Result<(), DiscoveryError> {
        let record = self.current_record(state)?;
        info!(
            service = %record.service_name,
            address = %record.address,
            port = record.port,
            "registering availability"
        );

        let bytes = self.codec.encode(&record)?;
        let path = self.record_path(&record);
        self.store.put(&path, bytes).await?;

        state.phase = RegistrationState::Registered;
        state.want_registered = true;
        debug!(path = %path, "registered in coordination store");
        Ok(())
    }

    async fn unregister(&self) -> Result<(), DiscoveryError> {
        if self.config.read_only {
            return Err(DiscoveryError::ReadOnly);
        }

        let mut state = self.state.lock().await;
        let record = self.current_record(&mut state)?;
        info!(
            service = %record.service_name,
            address = %record.address,
            port = record.port,
            "unregistering availability"
        );

        let path = self.record_path(&record);
        self.store.delete(&path).await?;

        state.phase = RegistrationState::Unregistered;
        state.want_registered = false;
        debug!(path = %path, "unregistered from coordination store");
        Ok(())
    }
}

/// Listen for session-state transitions and re-register after a reconnect.
///
/// Failures here are reported through tracing, not raised: there is no caller
/// on this path. The next reconnect event retries; no retry loop is spun up.
fn spawn_reconnect_task(shared: &Arc<AdvertiserShared>) {
    let mut session_rx = shared.store.subscribe_session();
    let weak = Arc::downgrade(shared);

    tokio::spawn(async move {
        loop {
            match session_rx.recv().await {
                Ok(SessionEvent::Reconnected) => {
                    let Some(shared) = weak.upgrade() else { return };
                    match shared.register_if_wanted().await {
                        Ok(true) => {
                            info!("session re-established, availability re-registered");
                        }
                        Ok(false) => {
                            debug!("session re-established; instance is deliberately unregistered, leaving it so");
                        }
                        Err(e) => {
                            error!(error = %e, "automatic re-registration failed; will retry on next reconnect");
                        }
                    }
                }
                Ok(SessionEvent::Suspended) => {
                    warn!("coordination session suspended; ephemeral record may be dropped");
                }
                Ok(SessionEvent::Connected) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "session event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn resolve_listen_address(fallback: &str) -> String {
    match discover_local_address() {
        Some(address) => {
            debug!(address = %address, "using discovered local address");
            address.to_string()
        }
        None => {
            debug!(fallback, "no non-loopback local address, using configured fallback");
            fallback.to_string()
        }
    }
}

/// First non-loopback local address, via the routing table (a UDP connect
/// sends no packets; it only asks the kernel which source address it would
/// pick).
fn discover_local_address() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("10.254.254.254", 1)).ok()?;
    let address = socket.local_addr().ok()?.ip();
    if address.is_loopback() || address.is_unspecified() {
        return None;
    }
    Some(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::for_service("payments")
    }

    fn advertiser(store: &MemoryStore) -> Advertiser {
        Advertiser::new(config(), Arc::new(store.clone())).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn stored_record(store: &MemoryStore) -> InstanceRecord {
        let entries = store.list("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        JsonRecordCodec.decode(&entries[0].1).unwrap()
    }

    #[tokio::test]
    async fn test_register_before_init_fails() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        let err = advertiser.register_availability().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotInitialized));
        assert!(matches!(
            advertiser.unregister_availability().await.unwrap_err(),
            DiscoveryError::NotInitialized
        ));
    }

    #[tokio::test]
    async fn test_zero_port_fails_registration() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        advertiser.init_listen_info(0).await;
        assert!(matches!(
            advertiser.register_availability().await.unwrap_err(),
            DiscoveryError::NotInitialized
        ));
    }

    #[tokio::test]
    async fn test_register_stores_record_with_port() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        advertiser.init_listen_info(9090).await;
        advertiser.register_availability().await.unwrap();

        let record = stored_record(&store).await;
        assert_eq!(record.port, 9090);
        assert_eq!(record.service_name, "payments");
        assert_eq!(record.instance_id, advertiser.instance_id());
        assert!(!record.address.is_empty());
        assert_eq!(
            advertiser.registration_state().await,
            RegistrationState::Registered
        );
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        advertiser.init_listen_info(9090).await;
        advertiser.register_availability().await.unwrap();

        advertiser.unregister_availability().await.unwrap();
        advertiser.unregister_availability().await.unwrap();
        assert!(store.is_empty());
        assert_eq!(
            advertiser.registration_state().await,
            RegistrationState::Unregistered
        );
    }

    #[tokio::test]
    async fn test_reconnect_re_registers_same_instance_id() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        advertiser.init_listen_info(9090).await;
        advertiser.register_availability().await.unwrap();
        let id = advertiser.instance_id();

        store.interrupt_session();
        assert!(store.is_empty());
        store.restore_session();

        let probe = store.clone();
        wait_until(move || !probe.is_empty()).await;
        assert_eq!(stored_record(&store).await.instance_id, id);
    }

    #[tokio::test]
    async fn test_deliberate_unregister_survives_reconnect() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        advertiser.init_listen_info(9090).await;
        advertiser.register_availability().await.unwrap();
        advertiser.unregister_availability().await.unwrap();

        store.interrupt_session();
        store.restore_session();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.is_empty());
        assert_eq!(
            advertiser.registration_state().await,
            RegistrationState::Unregistered
        );
    }

    #[tokio::test]
    async fn test_reregistration_rechecks_desired_state_under_lock() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        advertiser.init_listen_info(9090).await;
        advertiser.register_availability().await.unwrap();
        advertiser.unregister_availability().await.unwrap();

        // The reconnect path's registration variant must observe the
        // withdrawal and write nothing.
        assert!(!advertiser.shared.register_if_wanted().await.unwrap());
        assert!(store.is_empty());
        assert_eq!(
            advertiser.registration_state().await,
            RegistrationState::Unregistered
        );

        advertiser.register_availability().await.unwrap();
        assert!(advertiser.shared.register_if_wanted().await.unwrap());
        assert_eq!(
            stored_record(&store).await.instance_id,
            advertiser.instance_id()
        );
    }

    #[tokio::test]
    async fn test_rebind_updates_port_keeps_identity() {
        let store = MemoryStore::new();
        let advertiser = advertiser(&store);

        advertiser.init_listen_info(9090).await;
        advertiser.register_availability().await.unwrap();

        advertiser.init_listen_info(9091).await;
        advertiser.register_availability().await.unwrap();

        let record = stored_record(&store).await;
        assert_eq!(record.port, 9091);
        assert_eq!(record.instance_id, advertiser.instance_id());
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        let mut config = config();
        config.read_only = true;
        let advertiser = Advertiser::new(config, Arc::new(store.clone())).unwrap();

        advertiser.init_listen_info(9090).await;
        assert!(matches!(
            advertiser.register_availability().await.unwrap_err(),
            DiscoveryError::ReadOnly
        ));
    }
}
