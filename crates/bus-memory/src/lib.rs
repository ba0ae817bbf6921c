//! In-memory implementation of the fleet bus.
//!
//! The broker keeps retained messages and last-wills the way an external
//! broker would, so the coordination protocol can run inside one process.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod client;
mod error;

pub use broker::MemoryBroker;
pub use client::{MemoryBusClient, MemoryBusClientOptions};
pub use error::Error;
