//! IEEE 2030.5 smart meter to MQTT bridge
//!
//! Reads the meter's identity once, announces its sensors to Home Assistant
//! through MQTT discovery and then polls the configured endpoints, publishing
//! every value to the state topic discovery bound for it.

pub mod config;
pub mod discovery;
pub mod endpoints;
pub mod meter;
pub mod mqtt;
pub mod poller;
pub mod sep2;
pub mod telemetry;

// Re-export common types for easier access
pub use config::Settings;
pub use meter::{MeterSource, MeterTransport, RetryPolicy};
pub use mqtt::{BusPublisher, MqttBus};
pub use poller::{MeterPoller, PollerOptions, StartupError};
pub use sep2::MeterIdentity;
