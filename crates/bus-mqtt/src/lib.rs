//! MQTT implementation of the fleet bus.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;

pub use client::{MqttBusClient, MqttBusClientOptions};
pub use error::Error;
