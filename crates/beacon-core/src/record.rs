//! Instance Record
//!
//! The immutable payload one running instance advertises: a stable
//! per-process id, the logical service it belongs to, and the address/port
//! callers should connect to.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Validation failures for an instance record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("service name must not be empty")]
    EmptyServiceName,
    #[error("listen address must not be empty")]
    EmptyAddress,
    #[error("listen port must be >= 1")]
    InvalidPort,
}

/// The record advertised for one running instance of a named service.
///
/// Never mutated after construction. The `instance_id` is generated once per
/// process lifetime and stays stable across re-registration, so discovery
/// clients see the same identity after a session bounce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: Uuid,
    pub service_name: String,
    pub address: String,
    pub port: u16,
}

impl InstanceRecord {
    pub fn new(
        instance_id: Uuid,
        service_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            instance_id,
            service_name: service_name.into(),
            address: address.into(),
            port,
        }
    }

    /// Check the record is fit for registration.
    ///
    /// Callers must not write a record to the coordination store before this
    /// passes: `port >= 1` and a non-empty address are required.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.service_name.is_empty() {
            return Err(RecordError::EmptyServiceName);
        }
        if self.address.is_empty() {
            return Err(RecordError::EmptyAddress);
        }
        if self.port < 1 {
            return Err(RecordError::InvalidPort);
        }
        Ok(())
    }
}

impl std::fmt::Display for InstanceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} <{}:{}>",
            self.service_name, self.instance_id, self.address, self.port
        )
    }
}
