//! Data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::errors::TelemetryError;

/// Sensor identifier
///
/// Sensors announce themselves with an `ID:<digits>` token, so a valid
/// identifier is a non-empty string of ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SensorId(String);

impl TryFrom<&str> for SensorId {
    type Error = TelemetryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TelemetryError::InvalidSensorId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl SensorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// GPS fix quality, from the GGA quality indicator digit
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum GpsQuality {
    #[serde(rename = "Fix not valid")]
    #[strum(serialize = "Fix not valid")]
    FixNotValid,
    #[serde(rename = "GPS fix")]
    #[strum(serialize = "GPS fix")]
    GpsFix,
    #[serde(rename = "Differential GPS fix")]
    #[strum(serialize = "Differential GPS fix")]
    DifferentialGpsFix,
    #[default]
    #[serde(rename = "Not applicable")]
    #[strum(serialize = "Not applicable")]
    NotApplicable,
    #[serde(rename = "RTK Fixed")]
    #[strum(serialize = "RTK Fixed")]
    RtkFixed,
    #[serde(rename = "RTK Float")]
    #[strum(serialize = "RTK Float")]
    RtkFloat,
    #[serde(rename = "INS Dead reckoning")]
    #[strum(serialize = "INS Dead reckoning")]
    InsDeadReckoning,
}

impl GpsQuality {
    /// Map a GGA quality indicator to a fix quality
    ///
    /// - 0 = fix not valid
    /// - 1 = GPS fix
    /// - 2 = differential GPS fix
    /// - 3 = not applicable
    /// - 4 = RTK fixed
    /// - 5 = RTK float
    /// - 6 = INS dead reckoning
    ///
    /// Anything else, including an empty field, is not applicable.
    pub fn from_indicator(indicator: &str) -> Self {
        match indicator.trim() {
            "0" => GpsQuality::FixNotValid,
            "1" => GpsQuality::GpsFix,
            "2" => GpsQuality::DifferentialGpsFix,
            "4" => GpsQuality::RtkFixed,
            "5" => GpsQuality::RtkFloat,
            "6" => GpsQuality::InsDeadReckoning,
            _ => GpsQuality::NotApplicable,
        }
    }
}

/// Whether a measurement stream is currently flowing for an entity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum ConnectionStatus {
    #[default]
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn from_active(active: bool) -> Self {
        if active {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}

/// Sensor type tags
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SensorType {
    Tide,
    Weather,
    Water,
    Pollution,
    Current,
}

/// Which sentence families a dial-out session forwards
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SentenceFilter {
    #[default]
    All,
    Gga,
    Hdt,
    Vtg,
    Depth,
}

/// Vessel configuration, maintained outside this service
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Vessel {
    pub call_sign: String,
    pub flag: String,
    pub class: String,
    pub builder: String,
    pub year_built: i32,
    pub heading_direction: i64,
    pub calibration: i64,
    pub width_m: i64,
    pub length_m: i64,
    pub bow_to_stern: i64,
    pub port_to_starboard: i64,
    #[serde(rename = "vessel_map_image")]
    pub image_map: String,
    pub image: String,
    /// Minimum number of seconds between two history records
    pub history_per_second: i64,
    pub minimum_knot_per_liter_gasoline: f64,
    pub maximum_knot_per_liter_gasoline: f64,
    /// History records are only written when this is set
    pub record_status: bool,
}

impl Vessel {
    /// Vessel with neutral configuration, recording every `history_per_second` seconds
    pub fn new(call_sign: &str, history_per_second: i64, record_status: bool) -> Self {
        Self {
            call_sign: call_sign.to_string(),
            flag: String::new(),
            class: String::new(),
            builder: String::new(),
            year_built: 0,
            heading_direction: 0,
            calibration: 0,
            width_m: 0,
            length_m: 0,
            bow_to_stern: 0,
            port_to_starboard: 0,
            image_map: String::new(),
            image: String::new(),
            history_per_second,
            minimum_knot_per_liter_gasoline: 0.0,
            maximum_knot_per_liter_gasoline: 0.0,
            record_status,
        }
    }

    pub fn history_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.history_per_second.max(0))
    }
}

/// Sensor configuration, maintained outside this service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: SensorId,
    pub types: Vec<SensorType>,
    pub latitude: String,
    pub longitude: String,
}

impl Sensor {
    pub fn has_type(&self, sensor_type: SensorType) -> bool {
        self.types.contains(&sensor_type)
    }
}

/// Persisted vessel telemetry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VesselRecord {
    pub id: i64,
    pub call_sign: String,
    /// Per-vessel sequence number, starting from 1
    pub series_id: i64,
    pub latitude: String,
    pub longitude: String,
    pub heading_degree: f64,
    pub speed_in_knots: f64,
    pub gps_quality_indicator: GpsQuality,
    pub water_depth: f64,
    pub telnet_status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
}

/// Vessel telemetry about to be appended to the history log
#[derive(Debug, Clone, PartialEq)]
pub struct NewVesselRecord {
    pub call_sign: String,
    pub series_id: i64,
    pub latitude: String,
    pub longitude: String,
    pub heading_degree: f64,
    pub speed_in_knots: f64,
    pub gps_quality_indicator: GpsQuality,
    pub water_depth: f64,
    pub telnet_status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
}

/// Persisted raw sensor payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRecord {
    pub id: i64,
    pub sensor_id: SensorId,
    pub raw_data: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSensorRecord {
    pub sensor_id: SensorId,
    pub raw_data: String,
    pub created_at: DateTime<Utc>,
}

/// Outbound connection the service keeps open to a remote device
#[derive(Debug, Clone, PartialEq)]
pub struct DialOutSession {
    pub id: i64,
    pub name: String,
    /// Vessel receiving the decoded sentences, if any
    pub call_sign: Option<String>,
    /// Sentence families to decode; `None` stores every line raw
    pub filter: Option<SentenceFilter>,
    pub host: String,
    pub port: u16,
}

impl DialOutSession {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Raw line received on a dial-out session that is not routed to a vessel
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionRecord {
    pub session_id: i64,
    pub raw_data: String,
    pub created_at: DateTime<Utc>,
}

/// Qualitative fuel efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
pub enum FuelEfficiencyStatus {
    Stopped,
    Efficient,
    Normal,
    #[serde(rename = "Below Normal")]
    #[strum(serialize = "Below Normal")]
    BelowNormal,
    Inefficient,
}

/// Current knots per liter, from speed and the vessel's configured bounds
pub fn fuel_efficiency(speed_in_knots: f64, min: f64, max: f64) -> f64 {
    if speed_in_knots <= 0.0 {
        return 0.0;
    }
    let efficiency = (speed_in_knots + min + max) / 3.0;
    (efficiency * 100.0).round() / 100.0
}

pub fn fuel_efficiency_status(current: f64, min: f64, max: f64) -> FuelEfficiencyStatus {
    if current <= 0.0 {
        return FuelEfficiencyStatus::Stopped;
    }

    let midpoint = (min + max) / 2.0;
    if current >= max {
        FuelEfficiencyStatus::Efficient
    } else if current >= midpoint {
        FuelEfficiencyStatus::Normal
    } else if current >= min {
        FuelEfficiencyStatus::BelowNormal
    } else {
        FuelEfficiencyStatus::Inefficient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn sensor_id_accepts_digits() {
        let id = SensorId::try_from(" 0042 ").unwrap();
        assert_eq!(id.as_str(), "0042");
        assert!(SensorId::try_from("").is_err());
        assert!(SensorId::try_from("12a").is_err());
    }

    #[test]
    fn gps_quality_from_indicator() {
        assert_eq!(GpsQuality::from_indicator("0"), GpsQuality::FixNotValid);
        assert_eq!(GpsQuality::from_indicator("1"), GpsQuality::GpsFix);
        assert_eq!(GpsQuality::from_indicator("2"), GpsQuality::DifferentialGpsFix);
        assert_eq!(GpsQuality::from_indicator("3"), GpsQuality::NotApplicable);
        assert_eq!(GpsQuality::from_indicator("4"), GpsQuality::RtkFixed);
        assert_eq!(GpsQuality::from_indicator("5"), GpsQuality::RtkFloat);
        assert_eq!(GpsQuality::from_indicator("6"), GpsQuality::InsDeadReckoning);
        assert_eq!(GpsQuality::from_indicator(""), GpsQuality::NotApplicable);
        assert_eq!(GpsQuality::from_indicator("9"), GpsQuality::NotApplicable);
    }

    #[test]
    fn enum_text_forms() {
        assert_eq!(GpsQuality::DifferentialGpsFix.as_ref(), "Differential GPS fix");
        assert_eq!(
            GpsQuality::from_str("INS Dead reckoning").unwrap(),
            GpsQuality::InsDeadReckoning
        );
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "Disconnected");
        assert_eq!(SentenceFilter::from_str("depth").unwrap(), SentenceFilter::Depth);
        assert_eq!(SensorType::Pollution.as_ref(), "pollution");
        assert_eq!(
            serde_json::to_string(&GpsQuality::RtkFloat).unwrap(),
            "\"RTK Float\""
        );
    }

    #[test]
    fn fuel_efficiency_rounds_to_two_decimals() {
        assert_eq!(fuel_efficiency(0.0, 2.0, 6.0), 0.0);
        assert_eq!(fuel_efficiency(-1.0, 2.0, 6.0), 0.0);
        assert_eq!(fuel_efficiency(10.0, 2.0, 6.0), 6.0);
        assert_eq!(fuel_efficiency(1.0, 1.0, 2.0), 1.33);
    }

    #[test]
    fn fuel_efficiency_status_bands() {
        assert_eq!(fuel_efficiency_status(0.0, 2.0, 6.0), FuelEfficiencyStatus::Stopped);
        assert_eq!(fuel_efficiency_status(6.0, 2.0, 6.0), FuelEfficiencyStatus::Efficient);
        assert_eq!(fuel_efficiency_status(4.5, 2.0, 6.0), FuelEfficiencyStatus::Normal);
        assert_eq!(fuel_efficiency_status(3.0, 2.0, 6.0), FuelEfficiencyStatus::BelowNormal);
        assert_eq!(fuel_efficiency_status(1.0, 2.0, 6.0), FuelEfficiencyStatus::Inefficient);
        assert_eq!(FuelEfficiencyStatus::BelowNormal.as_ref(), "Below Normal");
    }
}
