use crate::message::BusMessage;

use std::future::Future;

use async_trait::async_trait;

/// A trait representing the receiving end of a subscription.
#[async_trait]
pub trait MessageHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles the given message.
    async fn handle(&self, message: BusMessage);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: BusMessage) {
        (self)(message).await;
    }
}
