//! Coordination Store Health Probe
//!
//! Read-only check consumed by an external health-reporting collaborator:
//! verifies the coordination client is connected and the configured base
//! namespace is readable.

use crate::store::CoordinationStore;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Probe over the shared coordination client.
pub struct StoreHealthCheck {
    store: Arc<dyn CoordinationStore>,
    base_path: String,
}

impl StoreHealthCheck {
    pub fn new(store: Arc<dyn CoordinationStore>, base_path: impl Into<String>) -> Self {
        Self {
            store,
            base_path: base_path.into(),
        }
    }

    /// Unhealthy when the client is not connected or the base namespace
    /// cannot be read.
    pub async fn check(&self) -> HealthStatus {
        if let Err(e) = self.store.check().await {
            warn!(error = %e, "store health check failed");
            return HealthStatus::Unhealthy(format!("client not connected: {e}"));
        }

        if let Err(e) = self.store.list(&self.base_path).await {
            warn!(error = %e, base_path = %self.base_path, "namespace health check failed");
            return HealthStatus::Unhealthy(format!(
                "namespace {:?} not readable: {e}",
                self.base_path
            ));
        }

        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_healthy_when_session_up() {
        let store = MemoryStore::new();
        let check = StoreHealthCheck::new(Arc::new(store), "/beacon/services");
        assert_eq!(check.check().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_when_session_down() {
        let store = MemoryStore::new();
        let check = StoreHealthCheck::new(Arc::new(store.clone()), "/beacon/services");

        store.interrupt_session();
        let status = check.check().await;
        assert!(!status.is_healthy());

        store.restore_session();
        assert_eq!(check.check().await, HealthStatus::Healthy);
    }
}
