// src/store/memory.rs
//! In-process store, selected with a `memory:` database URL

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::TelemetryStore;
use crate::errors::TelemetryError;
use crate::models::{
    ConnectionStatus, DialOutSession, NewSensorRecord, NewSessionRecord, NewVesselRecord, Sensor,
    SensorId, SensorRecord, Vessel, VesselRecord,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: i64,
    pub session_id: i64,
    pub raw_data: String,
}

#[derive(Default)]
struct Tables {
    vessels: Vec<(Vessel, bool)>,
    sensors: Vec<(Sensor, bool)>,
    sessions: Vec<DialOutSession>,
    vessel_records: Vec<VesselRecord>,
    sensor_records: Vec<SensorRecord>,
    session_records: Vec<SessionRecord>,
}

/// Store keeping every table in memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    failing_reads: AtomicBool,
    configuration_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make configuration lookups fail until reset
    pub fn fail_reads(&self, failing: bool) {
        self.failing_reads.store(failing, Ordering::SeqCst);
    }

    /// Number of vessel configuration reads attempted, failed ones included
    pub fn configuration_reads(&self) -> usize {
        self.configuration_reads.load(Ordering::SeqCst)
    }

    fn check_readable(&self) -> Result<(), TelemetryError> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(TelemetryError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::DatabaseError(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    /// Insert or replace a vessel configuration
    pub async fn upsert_vessel(&self, vessel: Vessel) {
        let mut tables = self.tables.lock().await;
        tables.vessels.retain(|(v, _)| v.call_sign != vessel.call_sign);
        tables.vessels.push((vessel, false));
    }

    pub async fn soft_delete_vessel(&self, call_sign: &str) {
        let mut tables = self.tables.lock().await;
        for (vessel, deleted) in tables.vessels.iter_mut() {
            if vessel.call_sign == call_sign {
                *deleted = true;
            }
        }
    }

    pub async fn upsert_sensor(&self, sensor: Sensor) {
        let mut tables = self.tables.lock().await;
        tables.sensors.retain(|(s, _)| s.id != sensor.id);
        tables.sensors.push((sensor, false));
    }

    pub async fn upsert_session(&self, session: DialOutSession) {
        let mut tables = self.tables.lock().await;
        tables.sessions.retain(|s| s.id != session.id);
        tables.sessions.push(session);
    }

    pub async fn remove_session(&self, session_id: i64) {
        self.tables
            .lock()
            .await
            .sessions
            .retain(|s| s.id != session_id);
    }

    /// History of one vessel, oldest first
    pub async fn vessel_records(&self, call_sign: &str) -> Vec<VesselRecord> {
        self.tables
            .lock()
            .await
            .vessel_records
            .iter()
            .filter(|r| r.call_sign == call_sign)
            .cloned()
            .collect()
    }

    pub async fn sensor_records(&self, sensor_id: &SensorId) -> Vec<SensorRecord> {
        self.tables
            .lock()
            .await
            .sensor_records
            .iter()
            .filter(|r| &r.sensor_id == sensor_id)
            .cloned()
            .collect()
    }

    pub async fn session_records(&self) -> Vec<SessionRecord> {
        self.tables.lock().await.session_records.clone()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn append_vessel_record(
        &self,
        record: NewVesselRecord,
    ) -> Result<VesselRecord, TelemetryError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        let stored = VesselRecord {
            id: tables.vessel_records.len() as i64 + 1,
            call_sign: record.call_sign,
            series_id: record.series_id,
            latitude: record.latitude,
            longitude: record.longitude,
            heading_degree: record.heading_degree,
            speed_in_knots: record.speed_in_knots,
            gps_quality_indicator: record.gps_quality_indicator,
            water_depth: record.water_depth,
            telnet_status: record.telnet_status,
            created_at: record.created_at,
        };
        tables.vessel_records.push(stored.clone());
        Ok(stored)
    }

    async fn latest_vessel_record(
        &self,
        call_sign: &str,
    ) -> Result<Option<VesselRecord>, TelemetryError> {
        Ok(self
            .tables
            .lock()
            .await
            .vessel_records
            .iter()
            .rev()
            .find(|r| r.call_sign == call_sign)
            .cloned())
    }

    async fn update_vessel_record_status(
        &self,
        record_id: i64,
        status: ConnectionStatus,
    ) -> Result<(), TelemetryError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        if let Some(record) = tables.vessel_records.iter_mut().find(|r| r.id == record_id) {
            record.telnet_status = status;
        }
        Ok(())
    }

    async fn append_sensor_record(
        &self,
        record: NewSensorRecord,
    ) -> Result<SensorRecord, TelemetryError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        let stored = SensorRecord {
            id: tables.sensor_records.len() as i64 + 1,
            sensor_id: record.sensor_id,
            raw_data: record.raw_data,
            created_at: record.created_at,
        };
        tables.sensor_records.push(stored.clone());
        Ok(stored)
    }

    async fn latest_sensor_record(
        &self,
        sensor_id: &SensorId,
    ) -> Result<Option<SensorRecord>, TelemetryError> {
        Ok(self
            .tables
            .lock()
            .await
            .sensor_records
            .iter()
            .rev()
            .find(|r| &r.sensor_id == sensor_id)
            .cloned())
    }

    async fn append_session_record(&self, record: NewSessionRecord) -> Result<(), TelemetryError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().await;
        let id = tables.session_records.len() as i64 + 1;
        tables.session_records.push(SessionRecord {
            id,
            session_id: record.session_id,
            raw_data: record.raw_data,
        });
        Ok(())
    }

    async fn active_vessels(&self) -> Result<Vec<Vessel>, TelemetryError> {
        self.configuration_reads.fetch_add(1, Ordering::SeqCst);
        self.check_readable()?;
        Ok(self
            .tables
            .lock()
            .await
            .vessels
            .iter()
            .filter(|(_, deleted)| !deleted)
            .map(|(vessel, _)| vessel.clone())
            .collect())
    }

    async fn active_sensors(&self) -> Result<Vec<Sensor>, TelemetryError> {
        self.check_readable()?;
        Ok(self
            .tables
            .lock()
            .await
            .sensors
            .iter()
            .filter(|(_, deleted)| !deleted)
            .map(|(sensor, _)| sensor.clone())
            .collect())
    }

    async fn record_enabled_vessels(&self) -> Result<Vec<Vessel>, TelemetryError> {
        Ok(self
            .active_vessels()
            .await?
            .into_iter()
            .filter(|vessel| vessel.record_status)
            .collect())
    }

    async fn dial_out_sessions(&self) -> Result<Vec<DialOutSession>, TelemetryError> {
        self.check_readable()?;
        Ok(self.tables.lock().await.sessions.clone())
    }
}
