//! Beacon demo: advertise one instance and discover it.
//!
//! Runs entirely in-process against the memory store, showing the wiring
//! order a host process follows: store up, advertiser registered once the
//! port is known, engines started, then the reverse on shutdown.

use beacon_discovery::store::MemoryStore;
use beacon_discovery::{
    Advertiser, DiscoveryConfig, DiscoveryEngine, HealthStatus, StoreHealthCheck,
};
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = DiscoveryConfig::for_service("payments");
    let store = MemoryStore::new();
    let store: Arc<MemoryStore> = Arc::new(store);

    // Advertise this process once the listening port is known
    let advertiser = Advertiser::new(config.clone(), store.clone())?;
    advertiser.init_listen_info(9090).await;
    advertiser.register_availability().await?;
    info!(instance_id = %advertiser.instance_id(), "advertised");

    // Discover peers of the same service
    let engine = DiscoveryEngine::new(config.clone(), store.clone())?;
    engine.start().await?;

    for instance in engine.list_instances()? {
        info!(%instance, "discovered");
    }
    let selected = engine.select_instance()?;
    info!(%selected, "selected");

    let health = StoreHealthCheck::new(store.clone(), config.base_path.clone());
    match health.check().await {
        HealthStatus::Healthy => info!("coordination store healthy"),
        HealthStatus::Unhealthy(reason) => info!(reason = %reason, "coordination store unhealthy"),
    }

    // Shutdown order: engines first, then de-advertise
    engine.stop();
    advertiser.unregister_availability().await?;
    info!("done");
    Ok(())
}
