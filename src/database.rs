// src/database.rs
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tracing::{error, info};

use crate::{
    errors::TelemetryError,
    models::{
        ConnectionStatus, DialOutSession, NewSensorRecord, NewSessionRecord, NewVesselRecord,
        Sensor, SensorId, SensorRecord, Vessel, VesselRecord,
    },
    store::TelemetryStore,
};

mod models;

use models::{DialOutSessionRow, SensorRecordRow, SensorRow, VesselRecordRow};

const VESSEL_COLUMNS: &str = "\
    call_sign, flag, class, builder, year_built, heading_direction, calibration, \
    width_m, length_m, bow_to_stern, port_to_starboard, image_map, image, \
    history_per_second, minimum_knot_per_liter_gasoline, \
    maximum_knot_per_liter_gasoline, record_status";

const VESSEL_RECORD_COLUMNS: &str = "\
    id, call_sign, series_id, latitude, longitude, heading_degree, speed_in_knots, \
    gps_quality_indicator, water_depth, telnet_status, created_at";

/// Postgres-backed telemetry store
#[derive(Clone)]
pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    /// Wrap an existing pool and bring the schema up to date
    pub async fn new(pool: Pool<Postgres>) -> Result<Self, TelemetryError> {
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            error!("Failed to run migrations: {}", e);
            e
        })?;
        Ok(Self { pool })
    }

    pub async fn from_url(url: &str, max_connections: u32) -> Result<Self, TelemetryError> {
        info!("Connecting to database, max_connections={}", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl TelemetryStore for Database {
    async fn append_vessel_record(
        &self,
        record: NewVesselRecord,
    ) -> Result<VesselRecord, TelemetryError> {
        let query = format!(
            "INSERT INTO vessel_records (
                call_sign, series_id, latitude, longitude, heading_degree,
                speed_in_knots, gps_quality_indicator, water_depth, telnet_status,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING {VESSEL_RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, VesselRecordRow>(&query)
            .bind(&record.call_sign)
            .bind(record.series_id)
            .bind(&record.latitude)
            .bind(&record.longitude)
            .bind(record.heading_degree)
            .bind(record.speed_in_knots)
            .bind(record.gps_quality_indicator.as_ref())
            .bind(record.water_depth)
            .bind(record.telnet_status.as_ref())
            .bind(record.created_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn latest_vessel_record(
        &self,
        call_sign: &str,
    ) -> Result<Option<VesselRecord>, TelemetryError> {
        let query = format!(
            "SELECT {VESSEL_RECORD_COLUMNS} FROM vessel_records
            WHERE call_sign = $1 AND deleted_at IS NULL
            ORDER BY id DESC LIMIT 1"
        );
        sqlx::query_as::<_, VesselRecordRow>(&query)
            .bind(call_sign)
            .fetch_optional(&self.pool)
            .await?
            .map(VesselRecord::try_from)
            .transpose()
    }

    async fn update_vessel_record_status(
        &self,
        record_id: i64,
        status: ConnectionStatus,
    ) -> Result<(), TelemetryError> {
        sqlx::query(
            "UPDATE vessel_records SET telnet_status = $1, updated_at = now() WHERE id = $2",
        )
        .bind(status.as_ref())
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_sensor_record(
        &self,
        record: NewSensorRecord,
    ) -> Result<SensorRecord, TelemetryError> {
        let row = sqlx::query_as::<_, SensorRecordRow>(
            "INSERT INTO sensor_records (sensor_id, raw_data, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            RETURNING id, sensor_id, raw_data, created_at",
        )
        .bind(record.sensor_id.as_str())
        .bind(&record.raw_data)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn latest_sensor_record(
        &self,
        sensor_id: &SensorId,
    ) -> Result<Option<SensorRecord>, TelemetryError> {
        sqlx::query_as::<_, SensorRecordRow>(
            "SELECT id, sensor_id, raw_data, created_at FROM sensor_records
            WHERE sensor_id = $1 AND deleted_at IS NULL
            ORDER BY id DESC LIMIT 1",
        )
        .bind(sensor_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(SensorRecord::try_from)
        .transpose()
    }

    async fn append_session_record(&self, record: NewSessionRecord) -> Result<(), TelemetryError> {
        sqlx::query(
            "INSERT INTO telnet_records (telnet_session_id, raw_data, created_at, updated_at)
            VALUES ($1, $2, $3, $3)",
        )
        .bind(record.session_id)
        .bind(&record.raw_data)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_vessels(&self) -> Result<Vec<Vessel>, TelemetryError> {
        let query = format!(
            "SELECT {VESSEL_COLUMNS} FROM vessels WHERE deleted_at IS NULL ORDER BY call_sign"
        );
        Ok(sqlx::query_as::<_, Vessel>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn active_sensors(&self) -> Result<Vec<Sensor>, TelemetryError> {
        sqlx::query_as::<_, SensorRow>(
            "SELECT id, types, latitude, longitude FROM sensors
            WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Sensor::try_from)
        .collect()
    }

    async fn record_enabled_vessels(&self) -> Result<Vec<Vessel>, TelemetryError> {
        let query = format!(
            "SELECT {VESSEL_COLUMNS} FROM vessels
            WHERE record_status = true AND deleted_at IS NULL ORDER BY call_sign"
        );
        Ok(sqlx::query_as::<_, Vessel>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn dial_out_sessions(&self) -> Result<Vec<DialOutSession>, TelemetryError> {
        sqlx::query_as::<_, DialOutSessionRow>(
            "SELECT id, name, call_sign, type_ip, ip, port FROM telnet_sessions
            WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(DialOutSession::try_from)
        .collect()
    }
}
