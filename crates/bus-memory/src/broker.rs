use crate::error::Error;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use fleet_bus::{BusMessage, LastWill, topic_matches};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) type SessionId = u64;

#[derive(Debug)]
struct Session {
    id: SessionId,
    last_will: Option<LastWill>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    session: SessionId,
    pattern: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    closed: bool,
    next_session: SessionId,
    retained: BTreeMap<String, Bytes>,
    sessions: HashMap<String, Session>,
    subscriptions: Vec<SubscriptionEntry>,
}

impl BrokerState {
    fn session_name(&self, id: SessionId) -> Option<&str> {
        self.sessions
            .iter()
            .find(|(_, session)| session.id == id)
            .map(|(name, _)| name.as_str())
    }

    fn route(&mut self, message: &BusMessage, retain: bool) {
        if retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained
                    .insert(message.topic.clone(), message.payload.clone());
            }
        }

        self.subscriptions
            .retain(|subscription| !subscription.sender.is_closed());

        for subscription in &self.subscriptions {
            if topic_matches(&subscription.pattern, &message.topic) {
                let _ = subscription.sender.send(message.clone());
            }
        }
    }

    fn remove_session(&mut self, name: &str) -> Option<Session> {
        let session = self.sessions.remove(name)?;
        self.subscriptions
            .retain(|subscription| subscription.session != session.id);
        Some(session)
    }
}

/// An in-process broker with retained messages and last-wills.
///
/// Cloning the broker yields another handle to the same topics; every
/// `MemoryBusClient` created from a clone shares them.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates a new, empty `MemoryBroker`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The retained payload on `topic`, if any.
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Whether a session named `name` is connected.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.state.lock().sessions.contains_key(name)
    }

    /// Stop the broker. Every session is dropped without publishing its
    /// last-will and later connections are refused.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.sessions.clear();
        state.subscriptions.clear();
    }

    pub(crate) fn open_session(
        &self,
        name: &str,
        last_will: Option<LastWill>,
    ) -> Result<SessionId, Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::BrokerUnavailable);
        }

        if state.remove_session(name).is_some() {
            warn!("session `{}` taken over by a new connection", name);
        }

        state.next_session += 1;
        let id = state.next_session;
        state
            .sessions
            .insert(name.to_string(), Session { id, last_will });

        debug!("session `{}` opened", name);

        Ok(id)
    }

    /// Close session `id`. When `publish_will` is set the session's last-will
    /// is routed as if the connection had dropped.
    pub(crate) fn close_session(&self, id: SessionId, publish_will: bool) {
        let mut state = self.state.lock();
        let Some(name) = state.session_name(id).map(str::to_string) else {
            return;
        };

        let Some(session) = state.remove_session(&name) else {
            return;
        };

        debug!("session `{}` closed", name);

        if publish_will {
            if let Some(will) = session.last_will {
                debug!("publishing last-will of `{}` to {}", name, will.topic);
                state.route(&BusMessage::from(&will), will.retain);
            }
        }
    }

    pub(crate) fn publish(
        &self,
        id: SessionId,
        topic: &str,
        payload: Bytes,
        retain: bool,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.session_name(id).is_none() {
            return Err(Error::SessionClosed);
        }

        state.route(&BusMessage::new(topic, payload, false), retain);

        Ok(())
    }

    /// Register a subscription. Retained messages matching `pattern` are
    /// queued ahead of any live traffic.
    pub(crate) fn subscribe(
        &self,
        id: SessionId,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, Error> {
        let mut state = self.state.lock();
        if state.session_name(id).is_none() {
            return Err(Error::SessionClosed);
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        for (topic, payload) in &state.retained {
            if topic_matches(pattern, topic) {
                let _ = sender.send(BusMessage::new(topic.clone(), payload.clone(), true));
            }
        }

        state.subscriptions.push(SubscriptionEntry {
            session: id,
            pattern: pattern.to_string(),
            sender,
        });

        Ok(receiver)
    }
}
