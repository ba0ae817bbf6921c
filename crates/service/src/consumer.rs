use crate::topics::state_topic;

use std::sync::Arc;

use fleet_bus::{BusClient, BusMessage};
use fleet_ipc::ServiceMessage;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::warn;

/// Follows another service's retained state.
///
/// The latest decoded envelope is kept in a watch channel. An empty
/// payload clears it.
#[derive(Debug)]
pub struct StateConsumer<T> {
    receiver: watch::Receiver<Option<Arc<ServiceMessage<T>>>>,
    service: String,
}

impl<T> Clone for StateConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            service: self.service.clone(),
        }
    }
}

impl<T> StateConsumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Subscribe to the state of `service`.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the subscription fails.
    pub async fn start<B>(bus: &B, topic_prefix: &str, service: &str) -> Result<Self, B::Error>
    where
        B: BusClient,
    {
        let (sender, receiver) = watch::channel(None);
        let sender = Arc::new(sender);
        let name = service.to_string();

        bus.subscribe(
            &state_topic(topic_prefix, service),
            move |message: BusMessage| {
                let sender = sender.clone();
                let name = name.clone();
                async move {
                    if message.payload.is_empty() {
                        sender.send_replace(None);
                        return;
                    }

                    match ServiceMessage::<T>::from_slice(&message.payload) {
                        Ok(envelope) => {
                            sender.send_replace(Some(Arc::new(envelope)));
                        }
                        Err(e) => warn!("ignoring unparseable state from `{}`: {}", name, e),
                    }
                }
            },
        )
        .await?;

        Ok(Self {
            receiver,
            service: service.to_string(),
        })
    }

    /// The followed service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The latest envelope, if one has arrived.
    pub fn latest(&self) -> Option<Arc<ServiceMessage<T>>> {
        self.receiver.borrow().clone()
    }

    /// Resolves with the first envelope accepted by `predicate`, checking
    /// the current one first. Returns `None` if the subscription ended.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<Arc<ServiceMessage<T>>>
    where
        F: FnMut(&ServiceMessage<T>) -> bool,
    {
        self.receiver
            .wait_for(|latest| latest.as_deref().is_some_and(&mut predicate))
            .await
            .ok()
            .and_then(|latest| latest.clone())
    }

    /// Resolves with the next running envelope.
    pub async fn wait_running(&mut self) -> Option<Arc<ServiceMessage<T>>> {
        self.wait_for(ServiceMessage::is_running).await
    }
}
