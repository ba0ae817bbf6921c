use fleet_bus::{BusError, TopicError};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The client already holds a session.
    #[error("client `{0}` is already connected")]
    AlreadyConnected(String),

    /// The request queue to the event loop rejected a request.
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The broker could not be reached.
    #[error("failed to connect to mqtt broker: {0}")]
    Connect(#[from] rumqttc::ConnectionError),

    /// The broker answered the connection with an error code.
    #[error("mqtt broker refused the connection: {0:?}")]
    ConnectionRefused(rumqttc::ConnectReturnCode),

    /// The client has no session.
    #[error("client is not connected")]
    NotConnected,

    /// Invalid topic or pattern.
    #[error(transparent)]
    Topic(#[from] TopicError),
}

impl BusError for Error {}
