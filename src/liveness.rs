//! Silence detection for vessels and sensors

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::TelemetryError;
use crate::pipeline::Pipeline;
use crate::store;

pub struct LivenessDetector {
    pipeline: Arc<Pipeline>,
    timeout: chrono::Duration,
    sweep_interval: Duration,
}

/// Entities disconnected by one sweep
#[derive(Debug, Default, PartialEq)]
pub struct SweepOutcome {
    pub vessels: Vec<String>,
    pub sensors: Vec<String>,
}

impl LivenessDetector {
    pub fn new(pipeline: Arc<Pipeline>, timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            pipeline,
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX),
            sweep_interval,
        }
    }

    /// Disconnect every active entity silent for longer than the timeout
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for call_sign in self.pipeline.active_vessels().await {
            let last_seen = match self.pipeline.vessel_buffers().get(&call_sign).await {
                Some(buffer) => {
                    let buffer = buffer.lock().await;
                    buffer.last_position_at.or_else(|| buffer.last_update_at())
                }
                None => None,
            };
            if !self.is_stale(last_seen, now) {
                continue;
            }

            debug!(call_sign = %call_sign, ?last_seen, "Vessel went silent");
            if self.pipeline.disconnect_vessel(&call_sign).await.is_ok() {
                outcome.vessels.push(call_sign);
            }
        }

        for sensor_id in self.pipeline.active_sensors().await {
            let last_seen = match self.pipeline.sensor_buffers().get(sensor_id.as_str()).await {
                Some(buffer) => buffer.lock().await.last_update_at,
                None => None,
            };
            if !self.is_stale(last_seen, now) {
                continue;
            }

            info!(sensor_id = %sensor_id, "Sensor went silent");
            self.pipeline.disconnect_sensor(&sensor_id).await;
            outcome.sensors.push(sensor_id.to_string());
        }

        outcome
    }

    fn is_stale(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_seen {
            Some(last) => now - last > self.timeout,
            None => true,
        }
    }

    /// Mark the newest record of every recording vessel disconnected
    ///
    /// Run once at startup, before any listener accepts connections.
    pub async fn mark_all_disconnected(&self) -> Result<usize, TelemetryError> {
        let store = self.pipeline.store();
        let vessels = store.record_enabled_vessels().await?;

        let mut marked = 0;
        for vessel in &vessels {
            match store::mark_vessel_disconnected(store, &vessel.call_sign).await {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(call_sign = %vessel.call_sign, "Failed to mark vessel disconnected: {}", e);
                }
            }
        }
        info!(
            vessels = vessels.len(),
            marked, "Completed startup connection status check"
        );
        Ok(marked)
    }

    /// Sweep on the configured interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Liveness sweep stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }
}
