//! Persistent store boundary
//!
//! The relational store is owned by other services; this crate only appends
//! telemetry, reads the newest rows back and flips the connection status of
//! the newest vessel record.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::TelemetryError;
use crate::models::{
    ConnectionStatus, DialOutSession, NewSensorRecord, NewSessionRecord, NewVesselRecord, Sensor,
    SensorId, SensorRecord, Vessel, VesselRecord,
};

pub mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Append a vessel record to the history log
    async fn append_vessel_record(
        &self,
        record: NewVesselRecord,
    ) -> Result<VesselRecord, TelemetryError>;

    /// Newest history record for a vessel
    async fn latest_vessel_record(
        &self,
        call_sign: &str,
    ) -> Result<Option<VesselRecord>, TelemetryError>;

    /// Set the connection status of an existing history record
    async fn update_vessel_record_status(
        &self,
        record_id: i64,
        status: ConnectionStatus,
    ) -> Result<(), TelemetryError>;

    async fn append_sensor_record(
        &self,
        record: NewSensorRecord,
    ) -> Result<SensorRecord, TelemetryError>;

    async fn latest_sensor_record(
        &self,
        sensor_id: &SensorId,
    ) -> Result<Option<SensorRecord>, TelemetryError>;

    async fn append_session_record(&self, record: NewSessionRecord) -> Result<(), TelemetryError>;

    /// Vessels that are not soft-deleted
    async fn active_vessels(&self) -> Result<Vec<Vessel>, TelemetryError>;

    /// Sensors that are not soft-deleted
    async fn active_sensors(&self) -> Result<Vec<Sensor>, TelemetryError>;

    /// Vessels with history recording enabled
    async fn record_enabled_vessels(&self) -> Result<Vec<Vessel>, TelemetryError>;

    /// Configured dial-out sessions that are not soft-deleted
    async fn dial_out_sessions(&self) -> Result<Vec<DialOutSession>, TelemetryError>;
}

/// Flip the newest record of a vessel to disconnected
///
/// Returns `true` when a record changed status; a vessel without records or
/// one already marked disconnected is left alone.
pub async fn mark_vessel_disconnected(
    store: &dyn TelemetryStore,
    call_sign: &str,
) -> Result<bool, TelemetryError> {
    let Some(record) = store.latest_vessel_record(call_sign).await? else {
        debug!("No history record to mark disconnected for {}", call_sign);
        return Ok(false);
    };

    if record.telnet_status == ConnectionStatus::Disconnected {
        return Ok(false);
    }

    store
        .update_vessel_record_status(record.id, ConnectionStatus::Disconnected)
        .await?;
    info!(
        call_sign,
        series_id = record.series_id,
        "Marked vessel disconnected"
    );
    Ok(true)
}
