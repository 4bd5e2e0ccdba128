//! In-memory latest-known state per entity
//!
//! Each buffer sits behind its own mutex so updates for different entities
//! never contend; the surrounding map lock is only taken to look up, insert
//! or evict entries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::models::GpsQuality;
use crate::nmea::{coordinate_text, FieldUpdate};

/// Map of entity key to independently locked buffer
pub struct BufferStore<B> {
    buffers: RwLock<HashMap<String, Arc<Mutex<B>>>>,
}

impl<B: Default> BufferStore<B> {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Buffer for `key`, created empty on first use
    pub async fn get_or_create(&self, key: &str) -> Arc<Mutex<B>> {
        if let Some(buffer) = self.buffers.read().await.get(key) {
            return buffer.clone();
        }

        let mut buffers = self.buffers.write().await;
        buffers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(B::default())))
            .clone()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Mutex<B>>> {
        self.buffers.read().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<Mutex<B>>> {
        self.buffers.write().await.remove(key)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.buffers.read().await.contains_key(key)
    }

    /// Point-in-time list of all buffers
    pub async fn entries(&self) -> Vec<(String, Arc<Mutex<B>>)> {
        self.buffers
            .read()
            .await
            .iter()
            .map(|(key, buffer)| (key.clone(), buffer.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.buffers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffers.read().await.is_empty()
    }
}

impl<B: Default> Default for BufferStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest decoded navigation fields for one vessel
#[derive(Debug, Clone, Default)]
pub struct VesselBuffer {
    /// Empty until the first position sentence arrives
    pub latitude: String,
    pub longitude: String,
    pub heading_degree: f64,
    pub speed_in_knots: f64,
    pub gps_quality: GpsQuality,
    pub water_depth: f64,
    pub last_position_at: Option<DateTime<Utc>>,
    pub last_heading_at: Option<DateTime<Utc>>,
    pub last_speed_at: Option<DateTime<Utc>>,
    pub last_depth_at: Option<DateTime<Utc>>,
    /// Creation time of the last history record written from this buffer
    pub last_flush_at: Option<DateTime<Utc>>,
}

/// Immutable copy of a vessel buffer
#[derive(Debug, Clone, PartialEq)]
pub struct VesselSnapshot {
    pub latitude: String,
    pub longitude: String,
    pub heading_degree: f64,
    pub speed_in_knots: f64,
    pub gps_quality: GpsQuality,
    pub water_depth: f64,
    pub last_position_at: Option<DateTime<Utc>>,
    pub last_flush_at: Option<DateTime<Utc>>,
}

impl VesselBuffer {
    /// Merge one field group and stamp its update time
    pub fn apply(&mut self, update: &FieldUpdate, now: DateTime<Utc>) {
        match update {
            FieldUpdate::Position {
                latitude,
                longitude,
                quality,
            } => {
                self.latitude = coordinate_text(latitude.as_ref());
                self.longitude = coordinate_text(longitude.as_ref());
                self.gps_quality = *quality;
                self.last_position_at = Some(now);
            }
            FieldUpdate::Heading(heading) => {
                self.heading_degree = *heading;
                self.last_heading_at = Some(now);
            }
            FieldUpdate::Speed(speed) => {
                self.speed_in_knots = *speed;
                self.last_speed_at = Some(now);
            }
            FieldUpdate::Depth(depth) => {
                self.water_depth = *depth;
                self.last_depth_at = Some(now);
            }
        }
    }

    pub fn has_position(&self) -> bool {
        !self.latitude.is_empty() && !self.longitude.is_empty()
    }

    /// Most recent update of any field group
    pub fn last_update_at(&self) -> Option<DateTime<Utc>> {
        [
            self.last_position_at,
            self.last_heading_at,
            self.last_speed_at,
            self.last_depth_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    pub fn snapshot(&self) -> VesselSnapshot {
        VesselSnapshot {
            latitude: self.latitude.clone(),
            longitude: self.longitude.clone(),
            heading_degree: self.heading_degree,
            speed_in_knots: self.speed_in_knots,
            gps_quality: self.gps_quality,
            water_depth: self.water_depth,
            last_position_at: self.last_position_at,
            last_flush_at: self.last_flush_at,
        }
    }
}

/// Latest raw payload received from one sensor
#[derive(Debug, Clone, Default)]
pub struct SensorBuffer {
    pub raw_data: String,
    pub last_update_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub raw_data: String,
    pub last_update_at: Option<DateTime<Utc>>,
}

impl SensorBuffer {
    pub fn apply(&mut self, payload: &str, now: DateTime<Utc>) {
        self.raw_data = payload.to_string();
        self.last_update_at = Some(now);
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            raw_data: self.raw_data.clone(),
            last_update_at: self.last_update_at,
        }
    }
}
