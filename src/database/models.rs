// src/database/models.rs
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::errors::TelemetryError;
use crate::models::{
    ConnectionStatus, DialOutSession, GpsQuality, Sensor, SensorId, SensorRecord, SensorType,
    SentenceFilter, VesselRecord,
};

#[derive(Debug, sqlx::FromRow)]
pub(super) struct VesselRecordRow {
    id: i64,
    call_sign: String,
    series_id: i64,
    latitude: String,
    longitude: String,
    heading_degree: f64,
    speed_in_knots: f64,
    gps_quality_indicator: String, // Stored as display text
    water_depth: f64,
    telnet_status: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct SensorRow {
    id: String,
    types: Vec<String>,
    latitude: String,
    longitude: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct SensorRecordRow {
    id: i64,
    sensor_id: String,
    raw_data: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct DialOutSessionRow {
    id: i64,
    name: String,
    call_sign: Option<String>,
    type_ip: Option<String>,
    ip: String,
    port: i32,
}

fn parse_column<T: FromStr>(column: &'static str, value: String) -> Result<T, TelemetryError> {
    value
        .parse()
        .map_err(|_| TelemetryError::InvalidColumnValue { column, value })
}

impl TryFrom<VesselRecordRow> for VesselRecord {
    type Error = TelemetryError;

    fn try_from(row: VesselRecordRow) -> Result<Self, Self::Error> {
        Ok(VesselRecord {
            id: row.id,
            call_sign: row.call_sign,
            series_id: row.series_id,
            latitude: row.latitude,
            longitude: row.longitude,
            heading_degree: row.heading_degree,
            speed_in_knots: row.speed_in_knots,
            gps_quality_indicator: parse_column::<GpsQuality>(
                "gps_quality_indicator",
                row.gps_quality_indicator,
            )?,
            water_depth: row.water_depth,
            telnet_status: parse_column::<ConnectionStatus>("telnet_status", row.telnet_status)?,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<SensorRow> for Sensor {
    type Error = TelemetryError;

    fn try_from(row: SensorRow) -> Result<Self, Self::Error> {
        let id = SensorId::try_from(row.id.as_str())?;
        let types = row
            .types
            .iter()
            .filter_map(|tag| match SensorType::from_str(tag) {
                Ok(sensor_type) => Some(sensor_type),
                Err(_) => {
                    warn!("Ignoring unknown type {:?} on sensor {}", tag, id);
                    None
                }
            })
            .collect();

        Ok(Sensor {
            id,
            types,
            latitude: row.latitude,
            longitude: row.longitude,
        })
    }
}

impl TryFrom<SensorRecordRow> for SensorRecord {
    type Error = TelemetryError;

    fn try_from(row: SensorRecordRow) -> Result<Self, Self::Error> {
        Ok(SensorRecord {
            id: row.id,
            sensor_id: SensorId::try_from(row.sensor_id.as_str())?,
            raw_data: row.raw_data,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<DialOutSessionRow> for DialOutSession {
    type Error = TelemetryError;

    fn try_from(row: DialOutSessionRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| TelemetryError::InvalidColumnValue {
            column: "port",
            value: row.port.to_string(),
        })?;
        let filter = row
            .type_ip
            .map(|value| parse_column::<SentenceFilter>("type_ip", value))
            .transpose()?;

        Ok(DialOutSession {
            id: row.id,
            name: row.name,
            call_sign: row.call_sign.filter(|c| !c.trim().is_empty()),
            filter,
            host: row.ip,
            port,
        })
    }
}
