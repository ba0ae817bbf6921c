use crate::error::{Error, Result};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Whether a service is up.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    /// The service is offline. Its state is the declared offline state.
    Stopped,

    /// The service is running and its state is current.
    Running,
}

/// The retained envelope a service publishes on its state topic.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceMessage<T> {
    /// Liveness of the owning service.
    pub status: ServiceStatus,

    /// The owned state, or the offline state when stopped.
    pub state: Option<T>,
}

impl<T> ServiceMessage<T> {
    /// An envelope for a running service.
    pub const fn running(state: T) -> Self {
        Self {
            status: ServiceStatus::Running,
            state: Some(state),
        }
    }

    /// An envelope for a stopped service.
    pub const fn stopped(offline_state: Option<T>) -> Self {
        Self {
            status: ServiceStatus::Stopped,
            state: offline_state,
        }
    }

    /// Whether the envelope reports the service as running.
    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }
}

impl<T: Serialize> ServiceMessage<T> {
    /// Encode the envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<T: DeserializeOwned> ServiceMessage<T> {
    /// Decode an envelope from a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is empty or is not an envelope.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::Empty);
        }

        Ok(serde_json::from_slice(payload)?)
    }
}

impl<T: DeserializeOwned> TryFrom<Bytes> for ServiceMessage<T> {
    type Error = Error;

    fn try_from(payload: Bytes) -> Result<Self> {
        Self::from_slice(&payload)
    }
}
