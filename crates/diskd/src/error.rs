use thiserror::Error;

/// Errors that can occur in the disk service.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] fleet_config::Error),

    /// The main routine was started twice.
    #[error("disk manager already running")]
    AlreadyRunning,

    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    /// The service lifecycle failed.
    #[error(transparent)]
    Service(#[from] fleet_service::Error),

    /// The tracing subscriber could not be installed.
    #[error(transparent)]
    SetTracing(#[from] tracing::dispatcher::SetGlobalDefaultError),
}
