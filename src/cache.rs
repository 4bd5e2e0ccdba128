//! Read-mostly cache of vessel and sensor configuration
//!
//! Readers clone an `Arc` to the current snapshot and never hold the lock
//! while working with it; a refresh builds a complete new snapshot and swaps
//! it in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::TelemetryError;
use crate::models::{Sensor, SensorId, Vessel};
use crate::store::TelemetryStore;

#[derive(Debug)]
pub struct MetadataSnapshot {
    pub vessels: HashMap<String, Vessel>,
    pub sensors: HashMap<SensorId, Sensor>,
    pub fetched_at: Instant,
}

impl MetadataSnapshot {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

pub struct MetadataCache {
    store: Arc<dyn TelemetryStore>,
    ttl: Duration,
    state: RwLock<Arc<MetadataSnapshot>>,
    refreshing: Mutex<()>,
}

impl MetadataCache {
    /// Build the cache with an initial snapshot; fails if the store cannot be read
    pub async fn load(store: Arc<dyn TelemetryStore>, ttl: Duration) -> Result<Self, TelemetryError> {
        let snapshot = fetch(store.as_ref()).await?;
        info!(
            vessels = snapshot.vessels.len(),
            sensors = snapshot.sensors.len(),
            "Loaded vessel and sensor configuration"
        );
        Ok(Self {
            store,
            ttl,
            state: RwLock::new(Arc::new(snapshot)),
            refreshing: Mutex::new(()),
        })
    }

    /// Replace the snapshot with a fresh read of the store
    ///
    /// On failure the previous contents stay in place and are treated as
    /// fresh for another TTL, so lookups do not hit a failing store.
    pub async fn refresh(&self) -> Result<(), TelemetryError> {
        match fetch(self.store.as_ref()).await {
            Ok(snapshot) => {
                debug!(
                    vessels = snapshot.vessels.len(),
                    sensors = snapshot.sensors.len(),
                    "Refreshed metadata cache"
                );
                *self.state.write().await = Arc::new(snapshot);
                Ok(())
            }
            Err(e) => {
                error!("Failed to refresh metadata cache, keeping previous snapshot: {}", e);
                let mut state = self.state.write().await;
                *state = Arc::new(MetadataSnapshot {
                    vessels: state.vessels.clone(),
                    sensors: state.sensors.clone(),
                    fetched_at: Instant::now(),
                });
                Err(e)
            }
        }
    }

    /// Current snapshot, refreshed first if it has outlived the TTL
    pub async fn snapshot(&self) -> Arc<MetadataSnapshot> {
        let current = self.state.read().await.clone();
        if !current.is_expired(self.ttl) {
            return current;
        }

        // Only one caller refreshes; the others see the swapped snapshot.
        let _guard = self.refreshing.lock().await;
        let current = self.state.read().await.clone();
        if !current.is_expired(self.ttl) {
            return current;
        }
        let _ = self.refresh().await;
        self.state.read().await.clone()
    }

    pub async fn vessel(&self, call_sign: &str) -> Option<Vessel> {
        self.snapshot().await.vessels.get(call_sign).cloned()
    }

    pub async fn sensor(&self, sensor_id: &SensorId) -> Option<Sensor> {
        self.snapshot().await.sensors.get(sensor_id).cloned()
    }

    /// Refresh on the TTL cadence until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.ttl);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the snapshot is fresh.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Metadata cache refresh stopped");
                    break;
                }
                _ = interval.tick() => {
                    let _ = self.refresh().await;
                }
            }
        }
    }
}

async fn fetch(store: &dyn TelemetryStore) -> Result<MetadataSnapshot, TelemetryError> {
    let (vessels, sensors) = tokio::try_join!(store.active_vessels(), store.active_sensors())?;
    Ok(MetadataSnapshot {
        vessels: vessels
            .into_iter()
            .map(|vessel| (vessel.call_sign.clone(), vessel))
            .collect(),
        sensors: sensors
            .into_iter()
            .map(|sensor| (sensor.id.clone(), sensor))
            .collect(),
        fetched_at: Instant::now(),
    })
}
