//! Vessel monitor service

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vessel_monitor::{
    broadcast::BroadcastHub,
    cache::MetadataCache,
    config::AppConfig,
    database::Database,
    dialout::DialOutManager,
    errors::TelemetryError,
    listener::{Listener, ListenerKind},
    liveness::LivenessDetector,
    pipeline::Pipeline,
    server, startup,
    store::{MemoryStore, TelemetryStore},
};

const MEMORY_STORE_URL: &str = "memory:";

#[tokio::main]
async fn main() -> Result<(), TelemetryError> {
    #[cfg(feature = "dotenv")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    config.validate()?;

    let store: Arc<dyn TelemetryStore> = if config.database.url == MEMORY_STORE_URL {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(Database::from_url(&config.database.url, config.database.max_connections).await?)
    };

    let cache = Arc::new(MetadataCache::load(store.clone(), config.cache.ttl).await?);
    let pipeline = Arc::new(Pipeline::new(cache.clone(), store));
    let liveness = Arc::new(LivenessDetector::new(
        pipeline.clone(),
        config.liveness.disconnect_timeout,
        config.liveness.sweep_interval,
    ));

    let cancel = CancellationToken::new();
    let listeners = [
        (ListenerKind::Vessel, &config.vessel_listener),
        (ListenerKind::Sensor, &config.sensor_listener),
    ]
    .into_iter()
    .map(|(kind, listener_config)| {
        Listener::new(kind, listener_config.address(), pipeline.clone())
    })
    .collect();
    let mut tasks = startup::open_listeners(&liveness, listeners, &cancel).await?;

    tasks.push(tokio::spawn({
        let cache = cache.clone();
        let cancel = cancel.clone();
        async move { cache.run(cancel).await }
    }));
    tasks.push(tokio::spawn({
        let liveness = liveness.clone();
        let cancel = cancel.clone();
        async move { liveness.run(cancel).await }
    }));

    let dial_out = Arc::new(DialOutManager::new(
        pipeline.clone(),
        config.dial_out.clone(),
        cancel.child_token(),
    ));
    tasks.push(tokio::spawn({
        let dial_out = dial_out.clone();
        async move { dial_out.run().await }
    }));

    let (hub, hub_handle) = BroadcastHub::new(pipeline.clone(), config.broadcast.interval);
    tasks.push(tokio::spawn(hub.run(cancel.clone())));

    let broadcast_addr = config.broadcast.socket_addr()?;
    let server_task = tokio::spawn(server::serve(
        broadcast_addr,
        server::router(hub_handle),
        cancel.clone(),
    ));

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => info!("Broadcast server exited"),
                Ok(Err(e)) => error!("Broadcast server failed: {}", e),
                Err(e) => error!("Broadcast server task failed: {}", e),
            }
        }
    }

    cancel.cancel();
    dial_out.shutdown(config.shutdown.timeout).await;
    let _ = tokio::time::timeout(config.shutdown.timeout, futures::future::join_all(tasks)).await;

    pipeline.disconnect_all().await;
    info!("Shutdown complete");
    Ok(())
}
