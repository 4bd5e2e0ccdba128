//! Decides when buffered telemetry becomes a history record

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{debug, info};

use crate::buffer::VesselBuffer;
use crate::errors::TelemetryError;
use crate::models::{
    ConnectionStatus, NewSensorRecord, NewVesselRecord, SensorId, SensorRecord, Vessel,
    VesselRecord,
};
use crate::store::TelemetryStore;

static SENSOR_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"TS:(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})").expect("valid timestamp pattern")
});

pub struct PersistenceGate {
    store: Arc<dyn TelemetryStore>,
}

impl PersistenceGate {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Whether the buffer is due for a history record
    pub fn should_flush(vessel: &Vessel, buffer: &VesselBuffer, now: DateTime<Utc>) -> bool {
        if !vessel.record_status || !buffer.has_position() {
            return false;
        }
        match buffer.last_flush_at {
            Some(last) => now - last >= vessel.history_interval(),
            None => true,
        }
    }

    /// Append a history record from the buffer if one is due
    ///
    /// Must be called with the vessel's buffer lock held so that series ids
    /// of one vessel are allocated in order. A buffer that has never flushed
    /// takes the newest stored record as its last flush. A failed write
    /// leaves the buffer untouched.
    pub async fn evaluate(
        &self,
        vessel: &Vessel,
        buffer: &mut VesselBuffer,
        now: DateTime<Utc>,
    ) -> Result<Option<VesselRecord>, TelemetryError> {
        if !Self::should_flush(vessel, buffer, now) {
            return Ok(None);
        }

        let latest = self.store.latest_vessel_record(&vessel.call_sign).await?;
        if buffer.last_flush_at.is_none() {
            if let Some(record) = &latest {
                if now - record.created_at < vessel.history_interval() {
                    debug!(
                        call_sign = %vessel.call_sign,
                        series_id = record.series_id,
                        "Stored history is recent, waiting for the next interval"
                    );
                    buffer.last_flush_at = Some(record.created_at);
                    return Ok(None);
                }
            }
        }
        let series_id = latest.map_or(0, |record| record.series_id) + 1;

        let record = self
            .store
            .append_vessel_record(NewVesselRecord {
                call_sign: vessel.call_sign.clone(),
                series_id,
                latitude: buffer.latitude.clone(),
                longitude: buffer.longitude.clone(),
                heading_degree: buffer.heading_degree,
                speed_in_knots: buffer.speed_in_knots,
                gps_quality_indicator: buffer.gps_quality,
                water_depth: buffer.water_depth,
                telnet_status: ConnectionStatus::Connected,
                created_at: now,
            })
            .await?;

        buffer.last_flush_at = Some(record.created_at);
        info!(
            call_sign = %vessel.call_sign,
            series_id,
            "Stored vessel record"
        );
        Ok(Some(record))
    }

    /// Append one sensor record for a received payload
    pub async fn record_sensor(
        &self,
        sensor_id: &SensorId,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<SensorRecord, TelemetryError> {
        let created_at = embedded_timestamp(payload).unwrap_or_else(|| {
            debug!(sensor_id = %sensor_id, "No timestamp in sensor payload, using receive time");
            now
        });

        self.store
            .append_sensor_record(NewSensorRecord {
                sensor_id: sensor_id.clone(),
                raw_data: payload.to_string(),
                created_at,
            })
            .await
    }
}

/// `TS:YYYY-MM-DD HH:MM:SS` token of a sensor payload, read as UTC
pub fn embedded_timestamp(payload: &str) -> Option<DateTime<Utc>> {
    let captures = SENSOR_TIMESTAMP.captures(payload)?;
    NaiveDateTime::parse_from_str(&captures[1], "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmea::decode;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    const GGA: &str = "$GPGGA,123519,0610.5,S,10649.2,E,1,08,0.9,5.0,M,0.0,M,,";

    fn positioned_buffer(now: DateTime<Utc>) -> VesselBuffer {
        let mut buffer = VesselBuffer::default();
        buffer.apply(&decode(GGA).unwrap(), now);
        buffer
    }

    fn gate() -> (Arc<MemoryStore>, PersistenceGate) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), PersistenceGate::new(store))
    }

    #[test]
    fn flush_requires_position_and_recording() {
        let now = Utc::now();
        let vessel = Vessel::new("PKXY", 10, true);

        assert!(!PersistenceGate::should_flush(&vessel, &VesselBuffer::default(), now));
        assert!(PersistenceGate::should_flush(&vessel, &positioned_buffer(now), now));

        let disabled = Vessel::new("PKXY", 10, false);
        assert!(!PersistenceGate::should_flush(&disabled, &positioned_buffer(now), now));
    }

    #[test]
    fn flush_interval_is_measured_from_last_flush() {
        let t0 = Utc::now();
        let vessel = Vessel::new("PKXY", 10, true);
        let mut buffer = positioned_buffer(t0);
        buffer.last_flush_at = Some(t0);

        assert!(!PersistenceGate::should_flush(&vessel, &buffer, t0 + Duration::seconds(9)));
        assert!(PersistenceGate::should_flush(&vessel, &buffer, t0 + Duration::seconds(10)));
    }

    #[tokio::test]
    async fn series_ids_are_gap_free() {
        let (store, gate) = gate();
        let vessel = Vessel::new("PKXY", 0, true);
        let t0 = Utc::now();
        let mut buffer = positioned_buffer(t0);

        for i in 0..3 {
            let record = gate
                .evaluate(&vessel, &mut buffer, t0 + Duration::seconds(i))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.series_id, i + 1);
            assert_eq!(record.telnet_status, ConnectionStatus::Connected);
        }

        let series: Vec<i64> = store
            .vessel_records("PKXY")
            .await
            .iter()
            .map(|r| r.series_id)
            .collect();
        assert_eq!(series, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn series_continues_from_stored_history() {
        let (store, gate) = gate();
        let vessel = Vessel::new("PKXY", 0, true);
        let now = Utc::now();

        let mut first = positioned_buffer(now);
        gate.evaluate(&vessel, &mut first, now).await.unwrap();

        // A fresh buffer, as after a reconnect, continues the series.
        let mut second = positioned_buffer(now);
        let record = gate.evaluate(&vessel, &mut second, now).await.unwrap().unwrap();
        assert_eq!(record.series_id, 2);
        assert_eq!(store.vessel_records("PKXY").await.len(), 2);
    }

    #[tokio::test]
    async fn fresh_buffer_respects_interval_of_stored_history() {
        let (store, gate) = gate();
        let vessel = Vessel::new("PKXY", 60, true);
        let t0 = Utc::now();

        let mut first = positioned_buffer(t0);
        gate.evaluate(&vessel, &mut first, t0).await.unwrap().unwrap();

        // A reconnect 15 s later starts from an empty buffer.
        let reconnect = t0 + Duration::seconds(15);
        let mut second = positioned_buffer(reconnect);
        assert!(gate
            .evaluate(&vessel, &mut second, reconnect)
            .await
            .unwrap()
            .is_none());
        assert_eq!(second.last_flush_at, Some(t0));

        let due = t0 + Duration::seconds(60);
        let record = gate.evaluate(&vessel, &mut second, due).await.unwrap().unwrap();
        assert_eq!(record.series_id, 2);
        assert_eq!(store.vessel_records("PKXY").await.len(), 2);
    }

    #[tokio::test]
    async fn disabled_vessel_writes_nothing() {
        let (store, gate) = gate();
        let vessel = Vessel::new("PKXY", 0, false);
        let now = Utc::now();
        let mut buffer = positioned_buffer(now);

        assert!(gate.evaluate(&vessel, &mut buffer, now).await.unwrap().is_none());
        assert!(store.vessel_records("PKXY").await.is_empty());
        assert!(buffer.last_flush_at.is_none());
    }

    #[tokio::test]
    async fn failed_write_is_retried_on_next_evaluation() {
        let (store, gate) = gate();
        let vessel = Vessel::new("PKXY", 60, true);
        let now = Utc::now();
        let mut buffer = positioned_buffer(now);

        store.fail_writes(true);
        assert!(gate.evaluate(&vessel, &mut buffer, now).await.is_err());
        assert!(buffer.last_flush_at.is_none());

        store.fail_writes(false);
        let record = gate
            .evaluate(&vessel, &mut buffer, now + Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.series_id, 1);
        assert_eq!(buffer.last_flush_at, Some(now + Duration::seconds(1)));
    }

    #[test]
    fn embedded_timestamp_is_parsed() {
        assert_eq!(
            embedded_timestamp("ID:7 TS:2025-02-05 14:03:56 T:21.5"),
            Some(Utc.with_ymd_and_hms(2025, 2, 5, 14, 3, 56).unwrap())
        );
        assert_eq!(embedded_timestamp("ID:7 TS:2025-13-45 99:00:00"), None);
        assert_eq!(embedded_timestamp("ID:7 T:21.5"), None);
    }

    #[tokio::test]
    async fn sensor_record_uses_embedded_timestamp() {
        let (store, gate) = gate();
        let id = SensorId::try_from("7").unwrap();
        let now = Utc::now();

        let stamped = gate
            .record_sensor(&id, "ID:7 TS:2025-02-05 14:03:56 T:21.5", now)
            .await
            .unwrap();
        assert_eq!(
            stamped.created_at,
            Utc.with_ymd_and_hms(2025, 2, 5, 14, 3, 56).unwrap()
        );

        let unstamped = gate.record_sensor(&id, "ID:7 T:21.6", now).await.unwrap();
        assert_eq!(unstamped.created_at, now);
        assert_eq!(store.sensor_records(&id).await.len(), 2);
    }
}
