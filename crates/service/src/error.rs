use fleet_bus::{BusError, TopicError};
use thiserror::Error;

/// Boxed error used for bus failures and main routine failures, so the
/// core stays generic over the transport.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for the service lifecycle.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the service lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// The service name cannot be used as a topic root.
    #[error("invalid service name `{name}`: {source}")]
    InvalidName {
        /// The rejected name.
        name: String,

        /// Why it was rejected.
        source: TopicError,
    },

    /// The bus session is named differently from the service.
    #[error("service `{service}` is connected to the bus as `{bus}`")]
    NameMismatch {
        /// The service name.
        service: String,

        /// The bus session name.
        bus: String,
    },

    /// Connecting to the bus failed.
    #[error("failed to connect to the bus: {0}")]
    Connect(#[source] BoxError),

    /// A bus operation failed.
    #[error("bus error: {0}")]
    Bus(#[source] BoxError),

    /// The request kind cannot be used as a topic segment.
    #[error("invalid request kind `{kind}`: {source}")]
    InvalidRequestKind {
        /// The rejected kind.
        kind: String,

        /// Why it was rejected.
        source: TopicError,
    },

    /// A payload could not be encoded.
    #[error(transparent)]
    Serialize(#[from] fleet_ipc::Error),

    /// The offline state has been published; no further state is accepted.
    #[error("service has stopped")]
    Stopped,

    /// The main routine returned without being halted.
    #[error("main routine exited without a halt")]
    MainExited,

    /// The main routine failed.
    #[error("main routine failed: {0}")]
    Main(#[source] BoxError),
}

impl Error {
    pub(crate) fn bus<E: BusError>(error: E) -> Self {
        Self::Bus(Box::new(error))
    }

    pub(crate) fn connect<E: BusError>(error: E) -> Self {
        Self::Connect(Box::new(error))
    }
}
