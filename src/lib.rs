//! Vessel and sensor telemetry ingestion

pub mod broadcast;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod database;
pub mod dialout;
pub mod errors;
pub mod gate;
pub mod listener;
pub mod liveness;
pub mod models;
pub mod nmea;
pub mod pipeline;
pub mod server;
pub mod startup;
pub mod store;
