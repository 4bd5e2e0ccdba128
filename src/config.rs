//! Application configuration

use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::errors::TelemetryError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default = "ListenerConfig::default_vessel")]
    pub vessel_listener: ListenerConfig,
    #[serde(default = "ListenerConfig::default_sensor")]
    pub sensor_listener: ListenerConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub dial_out: DialOutConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection URL, or `memory:` for the in-process store
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_broadcast_port")]
    pub port: u16,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_broadcast_interval")]
    pub interval: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct DialOutConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_read_deadline")]
    pub read_deadline: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_cache_ttl")]
    pub ttl: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_shutdown_timeout")]
    pub timeout: Duration,
}

fn default_max_connections() -> u32 {
    5
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_broadcast_port() -> u16 {
    8090
}

fn default_broadcast_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_disconnect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_deadline() -> Duration {
    Duration::from_secs(1)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ListenerConfig {
    fn default_vessel() -> Self {
        Self {
            host: default_host(),
            port: 8080,
        }
    }

    fn default_sensor() -> Self {
        Self {
            host: default_host(),
            port: 8085,
        }
    }

    /// Socket address to bind
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_broadcast_port(),
            interval: default_broadcast_interval(),
        }
    }
}

impl BroadcastConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, TelemetryError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| TelemetryError::ConfigurationError {
                message: format!("Invalid broadcast address: {}", e),
            })
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            disconnect_timeout: default_disconnect_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for DialOutConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
            connect_timeout: default_connect_timeout(),
            read_deadline: default_read_deadline(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: default_shutdown_timeout(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/default")
    }

    /// Load configuration from the given file (without extension, optional)
    /// overlaid with `VESSELMON__` environment variables.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("VESSELMON")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.database.url.trim().is_empty() {
            return Err(TelemetryError::ConfigurationError {
                message: "Database URL cannot be empty".to_string(),
            });
        }
        if self.database.max_connections == 0 {
            return Err(TelemetryError::ConfigurationError {
                message: "Database max_connections must be greater than zero".to_string(),
            });
        }

        let durations = [
            ("broadcast.interval", self.broadcast.interval),
            ("liveness.disconnect_timeout", self.liveness.disconnect_timeout),
            ("liveness.sweep_interval", self.liveness.sweep_interval),
            ("dial_out.reconcile_interval", self.dial_out.reconcile_interval),
            ("dial_out.connect_timeout", self.dial_out.connect_timeout),
            ("dial_out.read_deadline", self.dial_out.read_deadline),
            ("cache.ttl", self.cache.ttl),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(TelemetryError::ConfigurationError {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }

        self.broadcast.socket_addr()?;
        Ok(())
    }
}
