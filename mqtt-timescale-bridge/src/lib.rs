//! MQTT → TimescaleDB bridge.
//!
//! Subscribes to one MQTT topic filter, decodes every message into a
//! [`codec::Reading`] and appends it to the `sensor_metrics` hypertable,
//! one transaction per message.

pub mod codec;
pub mod config;
pub mod pipeline;
pub mod schema;
pub mod shutdown;
pub mod sink;
pub mod store;
pub mod subscriber;
pub mod writer;
