//! Client for the speedtest.net measurement protocol.
//!
//! [`SpeedtestClient`] discovers its configuration and candidate servers
//! once at construction, then runs a full latency, download and upload
//! test on every [`MeasurementProvider::network_metrics`] call.

pub mod client;
pub mod config;
pub mod provider;
pub mod servers;

pub use client::{MeasurementOptions, SpeedtestClient};
pub use config::SpeedtestConfig;
pub use provider::{MeasurementKey, MeasurementProvider, MeasurementReading};
pub use servers::Server;
