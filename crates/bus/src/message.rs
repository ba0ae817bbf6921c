use bytes::Bytes;

/// A message delivered to a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    /// The concrete topic the message was published to.
    pub topic: String,

    /// The raw payload.
    pub payload: Bytes,

    /// Whether the message was replayed from the transport's retained cache.
    pub retained: bool,
}

impl BusMessage {
    /// Creates a new `BusMessage`.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
        }
    }
}

/// A message the transport publishes on a client's behalf when its session
/// drops uncleanly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    /// Topic the will is published to.
    pub topic: String,

    /// The will payload.
    pub payload: Bytes,

    /// Whether the will replaces the retained message on `topic`.
    pub retain: bool,
}

impl LastWill {
    /// Creates a new `LastWill`.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

impl From<&LastWill> for BusMessage {
    fn from(will: &LastWill) -> Self {
        Self::new(will.topic.clone(), will.payload.clone(), false)
    }
}
