use fleet_bus::{BusError, TopicError};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The client already holds a session.
    #[error("client `{0}` is already connected")]
    AlreadyConnected(String),

    /// The broker has been closed.
    #[error("broker is unavailable")]
    BrokerUnavailable,

    /// The client has no session.
    #[error("client is not connected")]
    NotConnected,

    /// The session was closed by the broker, usually because another client
    /// connected with the same name.
    #[error("session is no longer open")]
    SessionClosed,

    /// Invalid topic or pattern.
    #[error(transparent)]
    Topic(#[from] TopicError),
}

impl BusError for Error {}
