use thiserror::Error;

/// Result type for envelope encoding and decoding.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum Error {
    /// The payload was empty.
    #[error("payload is empty")]
    Empty,

    /// The payload was not valid JSON for the expected type.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
