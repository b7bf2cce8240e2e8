//! Beacon Discovery
//!
//! Lets a running server instance advertise itself to peers and lets clients
//! discover and select live instances of a named service, using an external
//! session-based coordination store (etcd) as the source of truth.
//!
//! The two stateful components are the [`Advertiser`] (registration state
//! machine, automatic re-registration after a session bounce) and the
//! [`DiscoveryEngine`] (locally cached instance view with pluggable selection
//! and down-instance quarantine).

pub mod advertiser;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod store;
pub mod strategy;

pub use advertiser::{Advertiser, RegistrationState};
pub use config::{ConfigError, DiscoveryConfig};
pub use engine::DiscoveryEngine;
pub use error::DiscoveryError;
pub use health::{HealthStatus, StoreHealthCheck};
pub use store::{CoordinationStore, SessionEvent, StoreError, StoreEvent};
pub use strategy::{DownInstancePolicy, RandomStrategy, RoundRobinStrategy, SelectionStrategy};
