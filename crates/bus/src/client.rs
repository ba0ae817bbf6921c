use crate::handler::MessageHandler;
use crate::message::LastWill;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for bus client errors
pub trait BusError: Error + Send + Sync + 'static {}

/// A session on a retained-message publish/subscribe transport.
///
/// Every client is created with the name of the service that owns it. The
/// last-will is handed over on `connect`; the transport broadcasts it on the
/// owner's behalf if the session drops without a clean `disconnect`.
#[async_trait]
pub trait BusClient
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the client.
    type Error: BusError;

    /// The session name. Two live sessions must never share a name.
    fn name(&self) -> &str;

    /// Establish the session and register `last_will` with the transport.
    async fn connect(&self, last_will: Option<LastWill>) -> Result<(), Self::Error>;

    /// Publish `payload` to `topic`.
    ///
    /// Retained payloads are cached per topic by the transport and delivered
    /// to every later subscriber as its first message on that topic.
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), Self::Error>;

    /// Invoke `handler` for every message whose topic matches `pattern`.
    ///
    /// Messages on one subscription are handled one at a time, in the order
    /// the transport delivered them. Separate subscriptions run concurrently.
    async fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<(), Self::Error>
    where
        H: MessageHandler;

    /// Publish the last-will registered on `connect`, if any, as a regular
    /// message and close the session.
    async fn disconnect(&self) -> Result<(), Self::Error>;
}
