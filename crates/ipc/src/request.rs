use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A request payload a service accepts on `<service>/request/<kind>`.
///
/// The `uuid` correlates the request with its response topic
/// `<service>/request/<kind>/<uuid>`, so it must be usable as one topic
/// segment.
pub trait ManagerRequest
where
    Self: DeserializeOwned + Debug + Send + 'static,
{
    /// The correlation id chosen by the requester.
    fn uuid(&self) -> &str;
}

/// The generic response to a request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RequestResponse {
    /// Correlation id copied from the request.
    pub uuid: String,

    /// Whether the request was carried out.
    pub success: bool,

    /// Why the request failed. Empty on success.
    #[serde(default)]
    pub reason: String,
}

impl RequestResponse {
    /// A successful response to the request `uuid`.
    pub fn success(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            success: true,
            reason: String::new(),
        }
    }

    /// A failed response to the request `uuid`.
    pub fn failure(uuid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            success: false,
            reason: reason.into(),
        }
    }
}

/// A fresh correlation id for an outgoing request.
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_defaults_to_empty() {
        let response: RequestResponse =
            serde_json::from_str(r#"{"uuid": "abc", "success": true}"#).unwrap();

        assert_eq!(response, RequestResponse::success("abc"));
    }

    #[test]
    fn test_request_ids_are_topic_safe() {
        let id = new_request_id();

        assert!(!id.is_empty());
        assert!(!id.contains(['/', '+', '#']));
        assert_ne!(id, new_request_id());
    }
}
