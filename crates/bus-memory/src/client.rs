use crate::broker::{MemoryBroker, SessionId};
use crate::error::Error;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_bus::{BusClient, LastWill, MessageHandler, validate_pattern, validate_topic};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Options for configuring a `MemoryBusClient`.
#[derive(Clone, Debug)]
pub struct MemoryBusClientOptions {
    /// The session name.
    pub name: String,
}

#[derive(Debug)]
struct Connection {
    last_will: Option<LastWill>,
    session: SessionId,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// A bus client connected to a `MemoryBroker`.
///
/// Clones share one session.
#[derive(Clone, Debug)]
pub struct MemoryBusClient {
    broker: MemoryBroker,
    connection: Arc<Mutex<Option<Connection>>>,
    options: Arc<MemoryBusClientOptions>,
}

impl MemoryBusClient {
    /// Creates a new `MemoryBusClient`. No session is opened until `connect`.
    #[must_use]
    pub fn new(broker: MemoryBroker, options: MemoryBusClientOptions) -> Self {
        Self {
            broker,
            connection: Arc::new(Mutex::new(None)),
            options: Arc::new(options),
        }
    }

    /// Drop the session without a clean disconnect, as a crashed process
    /// would. The broker publishes the last-will.
    pub fn abort(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };

        debug!("aborting session `{}`", self.options.name);

        self.broker.close_session(connection.session, true);
        connection.shutdown_token.cancel();
        connection.task_tracker.close();
    }

    fn session(&self) -> Result<(SessionId, CancellationToken, TaskTracker), Error> {
        self.connection
            .lock()
            .as_ref()
            .map(|connection| {
                (
                    connection.session,
                    connection.shutdown_token.clone(),
                    connection.task_tracker.clone(),
                )
            })
            .ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl BusClient for MemoryBusClient {
    type Error = Error;

    fn name(&self) -> &str {
        &self.options.name
    }

    async fn connect(&self, last_will: Option<LastWill>) -> Result<(), Error> {
        let mut connection = self.connection.lock();
        if connection.is_some() {
            return Err(Error::AlreadyConnected(self.options.name.clone()));
        }

        if let Some(will) = &last_will {
            validate_topic(&will.topic)?;
        }

        let session = self
            .broker
            .open_session(&self.options.name, last_will.clone())?;

        *connection = Some(Connection {
            last_will,
            session,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        });

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), Error> {
        validate_topic(topic)?;
        let (session, _, _) = self.session()?;

        self.broker.publish(session, topic, payload, retain)
    }

    async fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<(), Error>
    where
        H: MessageHandler,
    {
        validate_pattern(pattern)?;
        let (session, shutdown_token, task_tracker) = self.session()?;

        let mut receiver = self.broker.subscribe(session, pattern)?;

        debug!("`{}` subscribed to {}", self.options.name, pattern);

        task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => break,
                    message = receiver.recv() => {
                        match message {
                            Some(message) => handler.handle(message).await,
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let Some(connection) = self.connection.lock().take() else {
            return Err(Error::NotConnected);
        };

        if let Some(will) = &connection.last_will {
            if let Err(e) =
                self.broker
                    .publish(connection.session, &will.topic, will.payload.clone(), will.retain)
            {
                warn!("failed to publish offline message for `{}`: {}", self.options.name, e);
            }
        }

        self.broker.close_session(connection.session, false);

        connection.shutdown_token.cancel();
        connection.task_tracker.close();
        connection.task_tracker.wait().await;

        debug!("`{}` disconnected", self.options.name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_bus::BusMessage;
    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};

    fn client(broker: &MemoryBroker, name: &str) -> MemoryBusClient {
        MemoryBusClient::new(
            broker.clone(),
            MemoryBusClientOptions {
                name: name.to_string(),
            },
        )
    }

    async fn collector(
        client: &MemoryBusClient,
        pattern: &str,
    ) -> mpsc::UnboundedReceiver<BusMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        client
            .subscribe(pattern, move |message: BusMessage| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(message);
                }
            })
            .await
            .unwrap();
        receiver
    }

    async fn next(receiver: &mut mpsc::UnboundedReceiver<BusMessage>) -> BusMessage {
        timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = MemoryBroker::new();
        let publisher = client(&broker, "publisher");
        let subscriber = client(&broker, "subscriber");
        publisher.connect(None).await.unwrap();
        subscriber.connect(None).await.unwrap();

        let mut receiver = collector(&subscriber, "publisher/#").await;

        publisher
            .publish("publisher/a", Bytes::from("one"), false)
            .await
            .unwrap();
        publisher
            .publish("publisher/a", Bytes::from("two"), false)
            .await
            .unwrap();

        assert_eq!(next(&mut receiver).await.payload, Bytes::from("one"));
        assert_eq!(next(&mut receiver).await.payload, Bytes::from("two"));
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_latest_retained() {
        let broker = MemoryBroker::new();
        let publisher = client(&broker, "publisher");
        publisher.connect(None).await.unwrap();

        for payload in ["one", "two", "three"] {
            publisher
                .publish("publisher", Bytes::from(payload), true)
                .await
                .unwrap();
        }

        let late = client(&broker, "late");
        late.connect(None).await.unwrap();
        let mut receiver = collector(&late, "publisher").await;

        let message = next(&mut receiver).await;
        assert!(message.retained);
        assert_eq!(message.payload, Bytes::from("three"));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abort_publishes_last_will() {
        let broker = MemoryBroker::new();
        let will = LastWill::new("crashy", Bytes::from("offline"), true);
        let crashy = client(&broker, "crashy");
        crashy.connect(Some(will)).await.unwrap();
        crashy
            .publish("crashy", Bytes::from("online"), true)
            .await
            .unwrap();

        crashy.abort();

        assert!(!broker.is_connected("crashy"));
        assert_eq!(broker.retained("crashy"), Some(Bytes::from("offline")));
    }

    #[tokio::test]
    async fn test_clean_disconnect_publishes_offline_message() {
        let broker = MemoryBroker::new();
        let will = LastWill::new("tidy", Bytes::from("offline"), true);
        let tidy = client(&broker, "tidy");
        tidy.connect(Some(will)).await.unwrap();
        tidy.publish("tidy", Bytes::from("online"), true)
            .await
            .unwrap();

        tidy.disconnect().await.unwrap();

        assert_eq!(broker.retained("tidy"), Some(Bytes::from("offline")));
        assert!(matches!(
            tidy.publish("tidy", Bytes::from("late"), true).await,
            Err(Error::NotConnected)
        ));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_same_name_takes_over_session() {
        let broker = MemoryBroker::new();
        let first = client(&broker, "twin");
        let second = client(&broker, "twin");
        first.connect(None).await.unwrap();
        second.connect(None).await.unwrap();

        assert!(logs_contain("taken over"));
        assert!(matches!(
            first.publish("twin", Bytes::from("stale"), true).await,
            Err(Error::SessionClosed)
        ));
        second
            .publish("twin", Bytes::from("fresh"), true)
            .await
            .unwrap();
        assert_eq!(broker.retained("twin"), Some(Bytes::from("fresh")));
    }

    #[tokio::test]
    async fn test_closed_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.close();

        let refused = client(&broker, "refused");
        assert!(matches!(
            refused.connect(None).await,
            Err(Error::BrokerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcards() {
        let broker = MemoryBroker::new();
        let publisher = client(&broker, "publisher");
        publisher.connect(None).await.unwrap();

        assert!(matches!(
            publisher.publish("publisher/+", Bytes::new(), false).await,
            Err(Error::Topic(_))
        ));
    }
}
