use crate::error::Error;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_bus::{
    BusClient, BusMessage, LastWill, MessageHandler, topic_matches, validate_pattern,
    validate_topic,
};
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Options for configuring a `MqttBusClient`.
#[derive(Clone, Debug)]
pub struct MqttBusClientOptions {
    /// Request queue capacity between the client and its event loop.
    pub capacity: usize,

    /// Username and password, if the broker requires them.
    pub credentials: Option<(String, String)>,

    /// The broker host.
    pub host: String,

    /// MQTT keep-alive interval.
    pub keep_alive: Duration,

    /// The client id, which is also the service name.
    pub name: String,

    /// The broker port.
    pub port: u16,
}

impl MqttBusClientOptions {
    /// Options for `name` connecting to `host:port` with default keep-alive
    /// and no credentials.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            capacity: 64,
            credentials: None,
            host: host.into(),
            keep_alive: Duration::from_secs(30),
            name: name.into(),
            port,
        }
    }

    fn mqtt_options(&self, last_will: Option<&LastWill>) -> MqttOptions {
        let mut options = MqttOptions::new(&self.name, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username, password);
        }

        if let Some(will) = last_will {
            options.set_last_will(rumqttc::LastWill::new(
                &will.topic,
                will.payload.to_vec(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        options
    }
}

#[derive(Debug)]
struct Subscription {
    /// Last payload handed to this subscription, per topic.
    delivered: Mutex<HashMap<String, Bytes>>,
    pattern: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl Subscription {
    fn new(pattern: &str, sender: mpsc::UnboundedSender<BusMessage>) -> Self {
        Self {
            delivered: Mutex::new(HashMap::new()),
            pattern: pattern.to_string(),
            sender,
        }
    }

    /// The broker answers every SUBSCRIBE, including the ones replayed after
    /// a reconnect, with the retained messages it matches. Since dispatch is
    /// local, those copies also reach older subscriptions; one repeating the
    /// payload a subscription already has is dropped.
    fn deliver(&self, message: &BusMessage) {
        let mut delivered = self.delivered.lock();
        if message.retained && delivered.get(&message.topic) == Some(&message.payload) {
            return;
        }
        delivered.insert(message.topic.clone(), message.payload.clone());
        drop(delivered);

        let _ = self.sender.send(message.clone());
    }
}

type Subscriptions = Arc<RwLock<Vec<Subscription>>>;

/// Retained payloads this client has published, replayed after a reconnect
/// so the broker's copy is not left at the last-will.
type RetainedCache = Arc<Mutex<HashMap<String, Bytes>>>;

struct Connection {
    client: AsyncClient,
    last_will: Option<LastWill>,
    event_loop_done: CancellationToken,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// A bus client backed by an MQTT broker.
///
/// Messages are exchanged with QoS 1, so the broker may redeliver a message
/// after a reconnect. Handlers that must act at most once deduplicate on
/// their own key, as request handling does with the request uuid.
#[derive(Clone)]
pub struct MqttBusClient {
    connection: Arc<Mutex<Option<Connection>>>,
    options: Arc<MqttBusClientOptions>,
    retained: RetainedCache,
    subscriptions: Subscriptions,
}

impl Debug for MqttBusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttBusClient")
            .field("name", &self.options.name)
            .field("host", &self.options.host)
            .field("port", &self.options.port)
            .finish_non_exhaustive()
    }
}

impl MqttBusClient {
    /// Creates a new `MqttBusClient`. Nothing is sent until `connect`.
    #[must_use]
    pub fn new(options: MqttBusClientOptions) -> Self {
        Self {
            connection: Arc::new(Mutex::new(None)),
            options: Arc::new(options),
            retained: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn session(&self) -> Result<(AsyncClient, CancellationToken, TaskTracker), Error> {
        self.connection
            .lock()
            .as_ref()
            .map(|connection| {
                (
                    connection.client.clone(),
                    connection.shutdown_token.clone(),
                    connection.task_tracker.clone(),
                )
            })
            .ok_or(Error::NotConnected)
    }

    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), Error> {
        loop {
            match event_loop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(Error::ConnectionRefused(ack.code));
                }
                event => debug!("mqtt event before connack: {:?}", event),
            }
        }
    }

    fn dispatch(subscriptions: &Subscriptions, message: &BusMessage) {
        let mut closed = false;
        for subscription in subscriptions.read().iter() {
            if subscription.sender.is_closed() {
                closed = true;
            } else if topic_matches(&subscription.pattern, &message.topic) {
                subscription.deliver(message);
            }
        }

        if closed {
            subscriptions
                .write()
                .retain(|subscription| !subscription.sender.is_closed());
        }
    }

    fn restore_session(
        client: &AsyncClient,
        subscriptions: &Subscriptions,
        retained: &RetainedCache,
    ) {
        for subscription in subscriptions.read().iter() {
            if let Err(e) = client.try_subscribe(subscription.pattern.clone(), QoS::AtLeastOnce) {
                warn!("failed to resubscribe to {}: {}", subscription.pattern, e);
            }
        }

        for (topic, payload) in retained.lock().iter() {
            if let Err(e) =
                client.try_publish(topic.clone(), QoS::AtLeastOnce, true, payload.to_vec())
            {
                warn!("failed to republish retained message on {}: {}", topic, e);
            }
        }
    }

    fn spawn_event_loop(&self, mut event_loop: EventLoop, connection: &Connection) {
        let client = connection.client.clone();
        let event_loop_done = connection.event_loop_done.clone();
        let retained = self.retained.clone();
        let shutdown_token = connection.shutdown_token.clone();
        let subscriptions = self.subscriptions.clone();

        connection.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = BusMessage::new(
                                publish.topic.clone(),
                                publish.payload.clone(),
                                publish.retain,
                            );
                            Self::dispatch(&subscriptions, &message);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("reconnected to mqtt broker");
                            Self::restore_session(&client, &subscriptions, &retained);
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            error!("mqtt connection error: {}", e);
                            tokio::select! {
                                () = shutdown_token.cancelled() => break,
                                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            }

            event_loop_done.cancel();
        });
    }
}

#[async_trait]
impl BusClient for MqttBusClient {
    type Error = Error;

    fn name(&self) -> &str {
        &self.options.name
    }

    async fn connect(&self, last_will: Option<LastWill>) -> Result<(), Error> {
        if self.connection.lock().is_some() {
            return Err(Error::AlreadyConnected(self.options.name.clone()));
        }

        if let Some(will) = &last_will {
            validate_topic(&will.topic)?;
        }

        let (client, mut event_loop) = AsyncClient::new(
            self.options.mqtt_options(last_will.as_ref()),
            self.options.capacity,
        );

        debug!(
            "connecting to mqtt broker at {}:{}",
            self.options.host, self.options.port
        );
        Self::wait_for_connack(&mut event_loop).await?;

        let connection = Connection {
            client,
            last_will,
            event_loop_done: CancellationToken::new(),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        };
        self.spawn_event_loop(event_loop, &connection);

        let mut slot = self.connection.lock();
        if slot.is_some() {
            connection.shutdown_token.cancel();
            return Err(Error::AlreadyConnected(self.options.name.clone()));
        }
        *slot = Some(connection);

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), Error> {
        validate_topic(topic)?;
        let (client, _, _) = self.session()?;

        if retain {
            if payload.is_empty() {
                self.retained.lock().remove(topic);
            } else {
                self.retained
                    .lock()
                    .insert(topic.to_string(), payload.clone());
            }
        }

        client
            .publish_bytes(topic, QoS::AtLeastOnce, retain, payload)
            .await?;

        Ok(())
    }

    async fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<(), Error>
    where
        H: MessageHandler,
    {
        validate_pattern(pattern)?;
        let (client, shutdown_token, task_tracker) = self.session()?;

        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.subscriptions
            .write()
            .push(Subscription::new(pattern, sender));

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

        client.subscribe(pattern, QoS::AtLeastOnce).await?;

        debug!("`{}` subscribed to {}", self.options.name, pattern);

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let Some(connection) = self.connection.lock().take() else {
            return Err(Error::NotConnected);
        };

        if let Some(will) = &connection.last_will {
            if let Err(e) = connection
                .client
                .publish_bytes(
                    will.topic.clone(),
                    QoS::AtLeastOnce,
                    will.retain,
                    will.payload.clone(),
                )
                .await
            {
                warn!("failed to publish offline message: {}", e);
            }
        }

        if let Err(e) = connection.client.disconnect().await {
            warn!("failed to send mqtt disconnect: {}", e);
        }

        if tokio::time::timeout(DISCONNECT_TIMEOUT, connection.event_loop_done.cancelled())
            .await
            .is_err()
        {
            warn!("mqtt event loop did not stop in time");
        }

        connection.shutdown_token.cancel();
        connection.task_tracker.close();
        connection.task_tracker.wait().await;

        self.subscriptions.write().clear();
        self.retained.lock().clear();

        info!("disconnected from mqtt broker");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_carry_last_will() {
        let options = MqttBusClientOptions::new("diskd", "localhost", 1883);
        let will = LastWill::new("diskd", Bytes::from("offline"), true);

        let mqtt_options = options.mqtt_options(Some(&will));
        let will = mqtt_options.last_will().expect("last will set");
        assert_eq!(will.topic, "diskd");
        assert_eq!(will.message, Bytes::from("offline"));
        assert!(will.retain);
        assert_eq!(mqtt_options.client_id(), "diskd");
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let client = MqttBusClient::new(MqttBusClientOptions::new("diskd", "localhost", 1883));

        assert!(matches!(
            client.publish("diskd", Bytes::new(), true).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_matches_patterns() {
        let subscriptions: Subscriptions = Arc::new(RwLock::new(Vec::new()));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        subscriptions
            .write()
            .push(Subscription::new("diskd/request/+", sender));

        MqttBusClient::dispatch(
            &subscriptions,
            &BusMessage::new("diskd/request/ping", Bytes::from("{}"), false),
        );
        MqttBusClient::dispatch(
            &subscriptions,
            &BusMessage::new("procd/request/ping", Bytes::from("{}"), false),
        );

        let message = receiver.try_recv().expect("matching message delivered");
        assert_eq!(message.topic, "diskd/request/ping");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_retained_replay_reaches_each_subscription_once() {
        let subscriptions: Subscriptions = Arc::new(RwLock::new(Vec::new()));
        let (early_sender, mut early) = mpsc::unbounded_channel();
        subscriptions
            .write()
            .push(Subscription::new("diskd", early_sender));

        MqttBusClient::dispatch(
            &subscriptions,
            &BusMessage::new("diskd", Bytes::from("running"), true),
        );

        let (late_sender, mut late) = mpsc::unbounded_channel();
        subscriptions
            .write()
            .push(Subscription::new("+", late_sender));

        // the broker answers the second SUBSCRIBE with the same retained copy
        MqttBusClient::dispatch(
            &subscriptions,
            &BusMessage::new("diskd", Bytes::from("running"), true),
        );

        assert_eq!(early.try_recv().unwrap().payload, Bytes::from("running"));
        assert!(early.try_recv().is_err());
        assert_eq!(late.try_recv().unwrap().payload, Bytes::from("running"));

        // a changed retained payload, as after a reconnect, is delivered
        MqttBusClient::dispatch(
            &subscriptions,
            &BusMessage::new("diskd", Bytes::from("stopped"), true),
        );
        assert_eq!(early.try_recv().unwrap().payload, Bytes::from("stopped"));
        assert_eq!(late.try_recv().unwrap().payload, Bytes::from("stopped"));

        // live traffic is never filtered
        MqttBusClient::dispatch(
            &subscriptions,
            &BusMessage::new("diskd", Bytes::from("stopped"), false),
        );
        assert!(early.try_recv().is_ok());
        assert!(late.try_recv().is_ok());
    }
}
