use std::path::PathBuf;

use thiserror::Error;

/// Result type for configuration loading.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        /// The file that could not be read.
        path: PathBuf,

        /// The underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for `FleetConfig`.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}
