//! Shared ingestion path for every transport
//!
//! Listeners and dial-out sessions only frame lines; everything from
//! decoding to persistence happens here.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::buffer::{BufferStore, SensorBuffer, VesselBuffer};
use crate::cache::MetadataCache;
use crate::errors::TelemetryError;
use crate::gate::PersistenceGate;
use crate::models::{
    DialOutSession, NewSessionRecord, SensorId, SensorRecord, SentenceFilter, VesselRecord,
};
use crate::nmea::{self, FieldUpdate};
use crate::store::{self, TelemetryStore};

static SENSOR_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ID:(\d+)").expect("valid sensor id pattern"));

pub struct Pipeline {
    cache: Arc<MetadataCache>,
    store: Arc<dyn TelemetryStore>,
    gate: PersistenceGate,
    vessel_buffers: BufferStore<VesselBuffer>,
    sensor_buffers: BufferStore<SensorBuffer>,
    active_vessels: Mutex<HashSet<String>>,
    active_sensors: Mutex<HashSet<SensorId>>,
}

impl Pipeline {
    pub fn new(cache: Arc<MetadataCache>, store: Arc<dyn TelemetryStore>) -> Self {
        Self {
            cache,
            gate: PersistenceGate::new(store.clone()),
            store,
            vessel_buffers: BufferStore::new(),
            sensor_buffers: BufferStore::new(),
            active_vessels: Mutex::new(HashSet::new()),
            active_sensors: Mutex::new(HashSet::new()),
        }
    }

    /// Decode one sentence for a vessel and persist it when due
    ///
    /// Sentences the filter does not accept, unknown sentence types and
    /// malformed input are dropped without error. Returns the history record
    /// written, if any.
    pub async fn ingest_vessel_line(
        &self,
        call_sign: &str,
        line: &str,
        filter: Option<SentenceFilter>,
    ) -> Result<Option<VesselRecord>, TelemetryError> {
        let line = line.trim();
        if !nmea::is_sentence(line) {
            debug!(call_sign, line, "Ignoring non-NMEA line");
            return Ok(None);
        }
        let Some(kind) = nmea::sentence_type(line) else {
            debug!(call_sign, line, "Ignoring unsupported sentence type");
            return Ok(None);
        };
        if let Some(filter) = filter {
            if !filter.accepts(kind) {
                return Ok(None);
            }
        }

        let Some(vessel) = self.cache.vessel(call_sign).await else {
            warn!(call_sign, "Dropping sentence for unknown vessel");
            return Err(TelemetryError::UnknownVessel(call_sign.to_string()));
        };

        let Some(update) = nmea::decode(line) else {
            return Ok(None);
        };

        let now = Utc::now();
        let buffer = self.vessel_buffers.get_or_create(call_sign).await;
        let mut buffer = buffer.lock().await;
        buffer.apply(&update, now);
        self.active_vessels
            .lock()
            .await
            .insert(call_sign.to_string());

        if !matches!(update, FieldUpdate::Position { .. }) {
            return Ok(None);
        }

        self.gate
            .evaluate(&vessel, &mut buffer, now)
            .await
            .map_err(|e| {
                error!(call_sign, "Failed to store vessel record: {}", e);
                e
            })
    }

    /// Buffer and persist one sensor payload
    pub async fn ingest_sensor_line(&self, line: &str) -> Result<SensorRecord, TelemetryError> {
        let payload = line.trim();
        let Some(captures) = SENSOR_ID.captures(payload) else {
            warn!(payload, "Dropping sensor payload without ID");
            return Err(TelemetryError::MissingSensorId(payload.to_string()));
        };
        let sensor_id = SensorId::try_from(&captures[1])?;

        if self.cache.sensor(&sensor_id).await.is_none() {
            warn!(sensor_id = %sensor_id, "Dropping payload for unknown sensor");
            return Err(TelemetryError::UnknownSensor(sensor_id.to_string()));
        }

        let now = Utc::now();
        let buffer = self.sensor_buffers.get_or_create(sensor_id.as_str()).await;
        let mut buffer = buffer.lock().await;
        buffer.apply(payload, now);
        self.active_sensors.lock().await.insert(sensor_id.clone());

        self.gate
            .record_sensor(&sensor_id, payload, now)
            .await
            .map_err(|e| {
                error!(sensor_id = %sensor_id, "Failed to store sensor record: {}", e);
                e
            })
    }

    /// Route one line received on a dial-out session
    ///
    /// Sentences go to the bound vessel when the session has both a call sign
    /// and a filter; every other line is kept raw against the session.
    pub async fn ingest_session_line(
        &self,
        session: &DialOutSession,
        line: &str,
    ) -> Result<Option<VesselRecord>, TelemetryError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        if let (Some(call_sign), Some(filter)) = (&session.call_sign, session.filter) {
            if line.starts_with('$') {
                return self.ingest_vessel_line(call_sign, line, Some(filter)).await;
            }
        }

        self.store
            .append_session_record(NewSessionRecord {
                session_id: session.id,
                raw_data: line.to_string(),
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| {
                error!(session = %session.name, "Failed to store session line: {}", e);
                e
            })?;
        Ok(None)
    }

    /// Mark a vessel disconnected and forget its live state
    ///
    /// If the store cannot be updated the vessel stays active with its buffer
    /// intact, so a later sweep tries again.
    pub async fn disconnect_vessel(&self, call_sign: &str) -> Result<bool, TelemetryError> {
        let marked = store::mark_vessel_disconnected(self.store.as_ref(), call_sign)
            .await
            .map_err(|e| {
                error!(call_sign, "Failed to mark vessel disconnected: {}", e);
                e
            })?;
        self.active_vessels.lock().await.remove(call_sign);
        self.vessel_buffers.remove(call_sign).await;
        Ok(marked)
    }

    pub async fn disconnect_sensor(&self, sensor_id: &SensorId) {
        self.active_sensors.lock().await.remove(sensor_id);
        self.sensor_buffers.remove(sensor_id.as_str()).await;
    }

    /// Disconnect every active vessel and sensor
    pub async fn disconnect_all(&self) {
        let vessels: Vec<String> = self.active_vessels.lock().await.iter().cloned().collect();
        for call_sign in vessels {
            let _ = self.disconnect_vessel(&call_sign).await;
        }

        let sensors: Vec<SensorId> = self.active_sensors.lock().await.iter().cloned().collect();
        for sensor_id in sensors {
            self.disconnect_sensor(&sensor_id).await;
        }
    }

    pub async fn active_vessels(&self) -> Vec<String> {
        self.active_vessels.lock().await.iter().cloned().collect()
    }

    pub async fn is_vessel_active(&self, call_sign: &str) -> bool {
        self.active_vessels.lock().await.contains(call_sign)
    }

    pub async fn active_sensors(&self) -> Vec<SensorId> {
        self.active_sensors.lock().await.iter().cloned().collect()
    }

    pub async fn is_sensor_active(&self, sensor_id: &SensorId) -> bool {
        self.active_sensors.lock().await.contains(sensor_id)
    }

    pub fn vessel_buffers(&self) -> &BufferStore<VesselBuffer> {
        &self.vessel_buffers
    }

    pub fn sensor_buffers(&self) -> &BufferStore<SensorBuffer> {
        &self.sensor_buffers
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn store(&self) -> &dyn TelemetryStore {
        self.store.as_ref()
    }
}
