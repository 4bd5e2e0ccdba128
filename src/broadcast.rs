//! Periodic fan-out of the live navigation and sensor picture
//!
//! [`BroadcastHub`] owns the subscriber set inside its own task. Each tick it
//! assembles one [`Snapshot`], serializes it once and offers the frame to
//! every subscriber queue without waiting.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::VesselSnapshot;
use crate::errors::TelemetryError;
use crate::models::{
    fuel_efficiency, fuel_efficiency_status, ConnectionStatus, FuelEfficiencyStatus, GpsQuality,
    SensorType, Vessel, VesselRecord,
};
use crate::nmea::Coordinate;
use crate::pipeline::Pipeline;

/// Frames buffered per subscriber before new ones are dropped
pub const SUBSCRIBER_QUEUE: usize = 16;

const COMMAND_QUEUE: usize = 64;

const KMH_PER_KNOT: f64 = 1.852;

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub navigation: BTreeMap<String, NavigationData>,
    pub sensors: BTreeMap<String, SensorData>,
}

#[derive(Debug, Serialize)]
pub struct NavigationData {
    pub call_sign: String,
    pub vessel: Vessel,
    pub telemetry: TelemetryData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryData {
    pub call_sign: String,
    pub latitude: String,
    pub longitude: String,
    pub latitude_dms: String,
    pub longitude_dms: String,
    pub latitude_decimal: f64,
    pub longitude_decimal: f64,
    pub heading_degree: f64,
    pub speed_in_knots: f64,
    pub speed_in_kmh: f64,
    pub gps_quality_indicator: GpsQuality,
    pub water_depth: f64,
    pub telnet_status: ConnectionStatus,
    pub last_update: Option<DateTime<Utc>>,
    pub current_knot_per_liter_gasoline: f64,
    pub fuel_efficiency_status: FuelEfficiencyStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorData {
    pub id: String,
    pub types: Vec<SensorType>,
    pub latitude: String,
    pub longitude: String,
    pub raw_data: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub connection_status: ConnectionStatus,
}

/// Fields shared by buffered and persisted telemetry
struct Reading<'a> {
    latitude: &'a str,
    longitude: &'a str,
    heading_degree: f64,
    speed_in_knots: f64,
    gps_quality: GpsQuality,
    water_depth: f64,
    last_update: Option<DateTime<Utc>>,
}

impl<'a> From<&'a VesselSnapshot> for Reading<'a> {
    fn from(buffer: &'a VesselSnapshot) -> Self {
        Self {
            latitude: &buffer.latitude,
            longitude: &buffer.longitude,
            heading_degree: buffer.heading_degree,
            speed_in_knots: buffer.speed_in_knots,
            gps_quality: buffer.gps_quality,
            water_depth: buffer.water_depth,
            last_update: buffer.last_position_at,
        }
    }
}

impl<'a> From<&'a VesselRecord> for Reading<'a> {
    fn from(record: &'a VesselRecord) -> Self {
        Self {
            latitude: &record.latitude,
            longitude: &record.longitude,
            heading_degree: record.heading_degree,
            speed_in_knots: record.speed_in_knots,
            gps_quality: record.gps_quality_indicator,
            water_depth: record.water_depth,
            last_update: Some(record.created_at),
        }
    }
}

/// Display form and signed decimal degrees of a stored coordinate
fn coordinate_forms(text: &str) -> (String, f64) {
    match Coordinate::parse(text) {
        Some(coordinate) => (coordinate.to_string(), coordinate.decimal()),
        None => (String::new(), 0.0),
    }
}

fn telemetry(vessel: &Vessel, reading: Reading<'_>, status: ConnectionStatus) -> TelemetryData {
    let (latitude_dms, latitude_decimal) = coordinate_forms(reading.latitude);
    let (longitude_dms, longitude_decimal) = coordinate_forms(reading.longitude);
    let efficiency = fuel_efficiency(
        reading.speed_in_knots,
        vessel.minimum_knot_per_liter_gasoline,
        vessel.maximum_knot_per_liter_gasoline,
    );

    TelemetryData {
        call_sign: vessel.call_sign.clone(),
        latitude: reading.latitude.to_string(),
        longitude: reading.longitude.to_string(),
        latitude_dms,
        longitude_dms,
        latitude_decimal,
        longitude_decimal,
        heading_degree: reading.heading_degree,
        speed_in_knots: reading.speed_in_knots,
        speed_in_kmh: reading.speed_in_knots * KMH_PER_KNOT,
        gps_quality_indicator: reading.gps_quality,
        water_depth: reading.water_depth,
        telnet_status: status,
        last_update: reading.last_update,
        current_knot_per_liter_gasoline: efficiency,
        fuel_efficiency_status: fuel_efficiency_status(
            efficiency,
            vessel.minimum_knot_per_liter_gasoline,
            vessel.maximum_knot_per_liter_gasoline,
        ),
    }
}

/// Build the current picture of every configured vessel and sensor
///
/// Live buffers take precedence over persisted records; entities with
/// neither are left out.
pub async fn assemble_snapshot(pipeline: &Pipeline) -> Snapshot {
    let metadata = pipeline.cache().snapshot().await;
    let mut navigation = BTreeMap::new();
    let mut sensors = BTreeMap::new();

    for (call_sign, vessel) in &metadata.vessels {
        let status = ConnectionStatus::from_active(pipeline.is_vessel_active(call_sign).await);

        let data = match pipeline.vessel_buffers().get(call_sign).await {
            Some(buffer) => {
                let buffered = buffer.lock().await.snapshot();
                telemetry(vessel, Reading::from(&buffered), status)
            }
            None => match pipeline.store().latest_vessel_record(call_sign).await {
                Ok(Some(record)) => telemetry(vessel, Reading::from(&record), status),
                Ok(None) => continue,
                Err(e) => {
                    warn!(call_sign = %call_sign, "Failed to read latest vessel record: {}", e);
                    continue;
                }
            },
        };

        navigation.insert(
            call_sign.clone(),
            NavigationData {
                call_sign: call_sign.clone(),
                vessel: vessel.clone(),
                telemetry: data,
            },
        );
    }

    for (sensor_id, sensor) in &metadata.sensors {
        let (raw_data, last_update) = match pipeline.sensor_buffers().get(sensor_id.as_str()).await {
            Some(buffer) => {
                let buffered = buffer.lock().await.snapshot();
                (buffered.raw_data, buffered.last_update_at)
            }
            None => match pipeline.store().latest_sensor_record(sensor_id).await {
                Ok(Some(record)) => (record.raw_data, Some(record.created_at)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(sensor_id = %sensor_id, "Failed to read latest sensor record: {}", e);
                    continue;
                }
            },
        };

        sensors.insert(
            sensor_id.to_string(),
            SensorData {
                id: sensor_id.to_string(),
                types: sensor.types.clone(),
                latitude: sensor.latitude.clone(),
                longitude: sensor.longitude.clone(),
                raw_data: Some(raw_data),
                last_update,
                connection_status: ConnectionStatus::from_active(
                    pipeline.is_sensor_active(sensor_id).await,
                ),
            },
        );
    }

    Snapshot {
        navigation,
        sensors,
    }
}

enum HubCommand {
    Subscribe {
        reply: oneshot::Sender<(Uuid, mpsc::Receiver<Utf8Bytes>)>,
    },
    Unsubscribe(Uuid),
}

/// Cloneable handle for registering with a running hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Register a subscriber and get the receiving end of its frame queue
    pub async fn subscribe(&self) -> Result<(Uuid, mpsc::Receiver<Utf8Bytes>), TelemetryError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Subscribe { reply })
            .await
            .map_err(|_| TelemetryError::HubClosed)?;
        response.await.map_err(|_| TelemetryError::HubClosed)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        let _ = self.commands.send(HubCommand::Unsubscribe(id)).await;
    }
}

pub struct BroadcastHub {
    pipeline: Arc<Pipeline>,
    interval: Duration,
    commands: mpsc::Receiver<HubCommand>,
    subscribers: HashMap<Uuid, mpsc::Sender<Utf8Bytes>>,
}

impl BroadcastHub {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let hub = Self {
            pipeline,
            interval,
            commands: rx,
            subscribers: HashMap::new(),
        };
        (hub, HubHandle { commands: tx })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = interval.tick() => {
                    if self.subscribers.is_empty() {
                        continue;
                    }
                    let snapshot = assemble_snapshot(&self.pipeline).await;
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => {
                            self.publish(Utf8Bytes::from(json));
                        }
                        Err(e) => warn!("Failed to serialize snapshot: {}", e),
                    }
                }
            }
        }

        info!(subscribers = self.subscribers.len(), "Broadcast hub stopped");
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Subscribe { reply } => {
                let id = Uuid::new_v4();
                let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
                if reply.send((id, rx)).is_ok() {
                    self.subscribers.insert(id, tx);
                    debug!(%id, subscribers = self.subscribers.len(), "Subscriber added");
                }
            }
            HubCommand::Unsubscribe(id) => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(%id, subscribers = self.subscribers.len(), "Subscriber removed");
                }
            }
        }
    }

    /// Offer one frame to every subscriber
    ///
    /// A subscriber whose queue is full misses this frame; one whose queue
    /// is closed is removed. Returns the number of frames queued.
    pub fn publish(&mut self, frame: Utf8Bytes) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%id, "Subscriber queue full, dropping frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%id, "Subscriber gone, removing");
                false
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
