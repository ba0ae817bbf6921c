use crate::error::{Error, Result};
use crate::handle::ServiceHandle;
use crate::topics::{request_topic, response_topic};

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_bus::{BusClient, BusMessage, MessageHandler, validate_segment};
use fleet_ipc::ManagerRequest;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Why an incoming request was dropped without reaching its handler.
#[derive(Debug, Error)]
pub enum Rejection {
    /// The payload is not UTF-8.
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    /// The payload is not JSON.
    #[error("unable to decode JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The payload is JSON but does not match the request type.
    #[error("it was not valid: {0}")]
    Invalid(#[source] serde_json::Error),

    /// The uuid cannot be used as a response topic segment.
    #[error("its uuid `{0}` is not a valid topic segment")]
    InvalidUuid(String),
}

impl Rejection {
    /// Whether the payload was not JSON at all.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::NotUtf8 | Self::Malformed(_))
    }
}

/// Decode a request payload.
///
/// # Errors
///
/// Returns the reason the payload was rejected.
pub fn decode_request<R>(payload: &[u8]) -> Result<R, Rejection>
where
    R: ManagerRequest,
{
    let text = std::str::from_utf8(payload).map_err(|_| Rejection::NotUtf8)?;
    let value: serde_json::Value = serde_json::from_str(text).map_err(Rejection::Malformed)?;
    let request: R = serde_json::from_value(value).map_err(Rejection::Invalid)?;

    if validate_segment(request.uuid()).is_err() {
        return Err(Rejection::InvalidUuid(request.uuid().to_string()));
    }

    Ok(request)
}

/// How many handled request ids are remembered per request kind.
const RECENT_REQUESTS: usize = 256;

/// Request ids already handled, oldest first.
#[derive(Debug, Default)]
struct RecentRequests {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentRequests {
    /// Record `uuid`. Returns `false` if it was already handled.
    fn insert(&mut self, uuid: &str) -> bool {
        if !self.ids.insert(uuid.to_string()) {
            return false;
        }

        self.order.push_back(uuid.to_string());
        if self.order.len() > RECENT_REQUESTS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }

        true
    }
}

struct RequestHandler<R, F, B> {
    bus: B,
    handled: Mutex<RecentRequests>,
    handler: F,
    kind: String,
    service: String,
    topic_prefix: String,
    _request: PhantomData<fn() -> R>,
}

#[async_trait]
impl<R, F, Fut, Resp, B> MessageHandler for RequestHandler<R, F, B>
where
    R: ManagerRequest,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Resp> + Send + 'static,
    Resp: Serialize + Send + 'static,
    B: BusClient,
{
    async fn handle(&self, message: BusMessage) {
        let request: R = match decode_request(&message.payload) {
            Ok(request) => request,
            Err(rejection) => {
                warn!(
                    "received {} request for `{}`, but {}: {}",
                    self.kind,
                    self.service,
                    rejection,
                    String::from_utf8_lossy(&message.payload)
                );
                return;
            }
        };

        let uuid = request.uuid().to_string();
        if !self.handled.lock().insert(&uuid) {
            warn!(
                "dropping redelivered {} request {} for `{}`",
                self.kind, uuid, self.service
            );
            return;
        }

        debug!("handling {} request {}", self.kind, uuid);

        let response = (self.handler)(request).await;

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                error!("failed to encode {} response {}: {}", self.kind, uuid, e);
                return;
            }
        };

        let topic = response_topic(&self.topic_prefix, &self.service, &self.kind, &uuid);
        if let Err(e) = self.bus.publish(&topic, payload, false).await {
            warn!("failed to publish {} response {}: {}", self.kind, uuid, e);
        }
    }
}

impl<T, B> ServiceHandle<T, B>
where
    T: Clone + Serialize + Send + Sync + 'static,
    B: BusClient,
{
    /// Serve `kind` requests. Each valid request calls `handler` once and its
    /// result is published, not retained, on the request's response topic.
    /// Malformed and invalid payloads are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `kind` is not a single topic segment or the
    /// subscription fails.
    pub async fn register_request<R, F, Fut, Resp>(&self, kind: &str, handler: F) -> Result<()>
    where
        R: ManagerRequest,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        validate_segment(kind).map_err(|source| Error::InvalidRequestKind {
            kind: kind.to_string(),
            source,
        })?;

        debug!("registering {} request for `{}`", kind, self.name());

        let topic = request_topic(self.topic_prefix(), self.name(), kind);
        let handler = RequestHandler {
            bus: self.bus().clone(),
            handled: Mutex::new(RecentRequests::default()),
            handler,
            kind: kind.to_string(),
            service: self.name().to_string(),
            topic_prefix: self.topic_prefix().to_string(),
            _request: PhantomData,
        };

        self.bus()
            .subscribe(&topic, handler)
            .await
            .map_err(Error::bus)
    }
}
