//! Discovery Configuration
//!
//! Centralized configuration for the coordination client, advertiser, and
//! discovery engine, with environment variable overrides. All values are
//! validated at load time; invalid values fail startup, not first use.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no coordination store hosts configured")]
    NoHosts,
    #[error("service name must not be empty")]
    EmptyServiceName,
    #[error("base path must not be empty")]
    EmptyBasePath,
    #[error("listen address fallback must not be empty")]
    EmptyListenAddress,
    #[error("session TTL must be at least 1 second")]
    ZeroSessionTtl,
    #[error("keep-alive interval must be shorter than the session TTL")]
    KeepAliveTooLong,
    #[error("refresh interval must be non-zero")]
    ZeroRefreshInterval,
    #[error("max retries must be at most 29")]
    TooManyRetries,
}

/// Discovery configuration with sensible defaults.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    // Quorum configuration
    /// Coordination store hosts (env: BEACON_HOSTS, comma-separated)
    pub hosts: Vec<String>,

    /// Coordination store client port (env: BEACON_PORT)
    pub port: u16,

    // Namespace configuration
    /// Root path all records live under (env: BEACON_BASE_PATH)
    pub base_path: String,

    /// Logical service this instance belongs to (env: BEACON_SERVICE_NAME)
    pub service_name: String,

    /// Advertised address when no non-loopback local address is discovered
    /// (env: BEACON_LISTEN_ADDRESS)
    pub listen_address: String,

    // Session settings
    /// Timeout for individual store round trips
    pub operation_timeout: Duration,

    /// TTL for the store session lease (seconds)
    pub session_ttl: i64,

    /// Interval for session keep-alive (1/3 of TTL recommended)
    pub keepalive_interval: Duration,

    // Connection retry settings
    /// Initial interval for store connection retry
    pub backoff_initial: Duration,

    /// Maximum interval for store connection retry
    pub backoff_max: Duration,

    /// Maximum elapsed time for store connection retries
    pub backoff_max_elapsed: Duration,

    /// Multiplier for connection backoff
    pub backoff_multiplier: f64,

    /// Maximum retry count for store connection attempts
    pub max_retries: u32,

    // Engine settings
    /// Interval for the periodic cache poll
    pub refresh_interval: Duration,

    /// Delay before re-establishing a failed watch stream
    pub watch_reconnect_delay: Duration,

    /// Reject local writes; the client only discovers, never advertises
    pub read_only: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
            port: 2379,
            base_path: "/beacon/services".to_string(),
            service_name: String::new(),
            listen_address: "127.0.0.1".to_string(),
            operation_timeout: Duration::from_secs(6),
            session_ttl: 15,
            keepalive_interval: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            backoff_max_elapsed: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_retries: 5,
            refresh_interval: Duration::from_secs(30),
            watch_reconnect_delay: Duration::from_secs(5),
            read_only: false,
        }
    }
}

impl DiscoveryConfig {
    /// Create configuration for one service name with defaults.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(hosts) = std::env::var("BEACON_HOSTS") {
            config.hosts = hosts.split(',').map(String::from).collect();
        }

        if let Ok(port) = std::env::var("BEACON_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                config.port = parsed;
            }
        }

        if let Ok(base_path) = std::env::var("BEACON_BASE_PATH") {
            config.base_path = base_path;
        }

        if let Ok(service_name) = std::env::var("BEACON_SERVICE_NAME") {
            config.service_name = service_name;
        }

        if let Ok(listen_address) = std::env::var("BEACON_LISTEN_ADDRESS") {
            config.listen_address = listen_address;
        }

        config
    }

    /// Formatted endpoint list for the coordination quorum:
    /// `http://host1:port`, `http://host2:port`, ...
    pub fn endpoints(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|host| format!("http://{}:{}", host, self.port))
            .collect()
    }

    /// Validate the configuration. Called by component constructors so that
    /// bad values fail at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() || self.hosts.iter().any(|h| h.is_empty()) {
            return Err(ConfigError::NoHosts);
        }
        if self.service_name.is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        if self.base_path.is_empty() {
            return Err(ConfigError::EmptyBasePath);
        }
        if self.listen_address.is_empty() {
            return Err(ConfigError::EmptyListenAddress);
        }
        if self.session_ttl < 1 {
            return Err(ConfigError::ZeroSessionTtl);
        }
        if self.keepalive_interval >= Duration::from_secs(self.session_ttl as u64) {
            return Err(ConfigError::KeepAliveTooLong);
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        if self.max_retries > 29 {
            return Err(ConfigError::TooManyRetries);
        }
        Ok(())
    }
}
