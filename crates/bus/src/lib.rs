//! Abstract interface for the retained-message bus shared by fleet services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Bus clients own a named session on the transport.
pub mod client;

/// Handlers process messages delivered to subscriptions.
pub mod handler;

/// Messages carried by the bus.
pub mod message;

/// Topics are hierarchical, `/`-separated channel names.
pub mod topic;

pub use client::{BusClient, BusError};
pub use handler::MessageHandler;
pub use message::{BusMessage, LastWill};
pub use topic::{TopicError, join, topic_matches, validate_pattern, validate_segment, validate_topic};
