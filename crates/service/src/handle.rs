use crate::context::ServiceContext;
use crate::dependency::DependencyTracker;
use crate::error::{Error, Result};
use crate::topics::state_topic;

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use fleet_bus::BusClient;
use fleet_config::FleetConfig;
use fleet_ipc::ServiceMessage;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Published<T> {
    value: Option<T>,
    stopped: bool,
}

struct Inner<T, B> {
    context: ServiceContext<B>,
    dependencies: DependencyTracker,
    name: String,
    published: Mutex<Published<T>>,
    topic_prefix: String,
}

/// What a running service sees of its manager: its state setter, the bus,
/// the halt token and its dependencies.
pub struct ServiceHandle<T, B> {
    inner: Arc<Inner<T, B>>,
}

impl<T, B> Clone for ServiceHandle<T, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, B> Debug for ServiceHandle<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.inner.name)
            .field("topic_prefix", &self.inner.topic_prefix)
            .finish_non_exhaustive()
    }
}

impl<T, B> ServiceHandle<T, B>
where
    T: Clone + Serialize + Send + Sync + 'static,
    B: BusClient,
{
    pub(crate) fn new(
        context: ServiceContext<B>,
        name: String,
        dependencies: DependencyTracker,
    ) -> Self {
        let topic_prefix = context.config().bus.topic_prefix.clone();

        Self {
            inner: Arc::new(Inner {
                context,
                dependencies,
                name,
                published: Mutex::new(Published {
                    value: None,
                    stopped: false,
                }),
                topic_prefix,
            }),
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bus client.
    pub fn bus(&self) -> &B {
        self.inner.context.bus()
    }

    /// The configuration.
    pub fn config(&self) -> &FleetConfig {
        self.inner.context.config()
    }

    /// The configured topic root.
    pub fn topic_prefix(&self) -> &str {
        &self.inner.topic_prefix
    }

    /// Store `value` as the service's state and publish it, retained, with
    /// status `RUNNING`. Every call publishes exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] once the offline state has been published,
    /// or an error if the publish fails.
    pub async fn set_state(&self, value: T) -> Result<()> {
        let mut published = self.inner.published.lock().await;
        if published.stopped {
            return Err(Error::Stopped);
        }

        let payload = ServiceMessage::running(&value).to_bytes()?;
        published.value = Some(value);

        self.bus()
            .publish(
                &state_topic(&self.inner.topic_prefix, &self.inner.name),
                payload,
                true,
            )
            .await
            .map_err(Error::bus)
    }

    /// The last value passed to [`ServiceHandle::set_state`].
    pub async fn state(&self) -> Option<T> {
        self.inner.published.lock().await.value.clone()
    }

    /// Publish the offline envelope. Later `set_state` calls fail.
    pub(crate) async fn publish_offline(&self, offline_state: Option<T>) -> Result<()> {
        let mut published = self.inner.published.lock().await;
        published.stopped = true;

        let payload = ServiceMessage::stopped(offline_state).to_bytes()?;

        debug!("publishing offline state of `{}`", self.inner.name);

        self.bus()
            .publish(
                &state_topic(&self.inner.topic_prefix, &self.inner.name),
                payload,
                true,
            )
            .await
            .map_err(Error::bus)
    }

    /// Request a cooperative halt.
    pub fn halt(&self) {
        self.inner.context.halt();
    }

    /// Whether a halt has been requested.
    pub fn is_halted(&self) -> bool {
        self.inner.context.shutdown_token().is_cancelled()
    }

    /// Resolves once the service is halted.
    pub async fn wait_loop(&self) {
        self.inner.context.shutdown_token().cancelled().await;
    }

    /// The halt token, for `select!` in long-running tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.context.shutdown_token()
    }

    /// Spawn a task the manager waits for before publishing the offline
    /// state. The task must watch the halt token.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.context.task_tracker().spawn(task)
    }

    /// The dependency tracker.
    pub fn dependencies(&self) -> &DependencyTracker {
        &self.inner.dependencies
    }

    /// Resolves once a running dependency stops, returning the lost ones.
    pub async fn wait_dependency_lost(&self) -> Vec<String> {
        self.inner.dependencies.wait_dependency_lost().await;
        self.inner.dependencies.lost_dependencies()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_bus_memory::{MemoryBroker, MemoryBusClient, MemoryBusClientOptions};
    use fleet_ipc::ServiceStatus;

    async fn handle(broker: &MemoryBroker) -> ServiceHandle<u32, MemoryBusClient> {
        let bus = MemoryBusClient::new(
            broker.clone(),
            MemoryBusClientOptions {
                name: "counter".to_string(),
            },
        );
        bus.connect(None).await.unwrap();

        ServiceHandle::new(
            ServiceContext::new(bus, FleetConfig::default()),
            "counter".to_string(),
            DependencyTracker::new(Vec::new()),
        )
    }

    #[tokio::test]
    async fn test_state_tracks_last_set() {
        let broker = MemoryBroker::new();
        let handle = handle(&broker).await;
        assert_eq!(handle.state().await, None);

        handle.set_state(1).await.unwrap();
        handle.set_state(2).await.unwrap();

        assert_eq!(handle.state().await, Some(2));
        let retained = ServiceMessage::<u32>::from_slice(&broker.retained("counter").unwrap())
            .unwrap();
        assert_eq!(retained.status, ServiceStatus::Running);
        assert_eq!(retained.state, Some(2));
    }

    #[tokio::test]
    async fn test_set_state_after_offline_fails() {
        let broker = MemoryBroker::new();
        let handle = handle(&broker).await;
        handle.set_state(5).await.unwrap();

        handle.publish_offline(Some(0)).await.unwrap();

        assert!(matches!(handle.set_state(6).await, Err(Error::Stopped)));
        assert_eq!(handle.state().await, Some(5));
        let retained = ServiceMessage::<u32>::from_slice(&broker.retained("counter").unwrap())
            .unwrap();
        assert_eq!(retained.status, ServiceStatus::Stopped);
        assert_eq!(retained.state, Some(0));
    }
}
