//! Errors for the vessel monitor
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    ConfigurationError { message: String },

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Database migration error")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Unknown vessel: {0}")]
    UnknownVessel(String),

    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("No sensor ID in message: {0}")]
    MissingSensorId(String),

    #[error("Invalid sensor ID: {0}")]
    InvalidSensorId(String),

    #[error("Invalid value {value:?} for column {column}")]
    InvalidColumnValue { column: &'static str, value: String },

    #[error("Broadcast hub is no longer running")]
    HubClosed,
}
