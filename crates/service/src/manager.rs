use crate::context::ServiceContext;
use crate::dependency::DependencyTracker;
use crate::error::{Error, Result};
use crate::handle::ServiceHandle;
use crate::service::Service;
use crate::topics::state_topic;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use fleet_bus::{BusClient, LastWill, validate_segment};
use fleet_ipc::ServiceMessage;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where a `StateManager` is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Lifecycle {
    /// Constructed, no bus activity yet.
    Init,

    /// Connecting to the bus.
    Connecting,

    /// Connected and waiting for every dependency to run.
    AwaitingDependencies,

    /// Serving requests and running the main routine.
    Running,

    /// Halted, winding down and publishing the offline state.
    Stopping,

    /// Disconnected. Terminal.
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::AwaitingDependencies => "AWAITING_DEPENDENCIES",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    validate_segment(name).map_err(|source| Error::InvalidName {
        name: name.to_string(),
        source,
    })
}

/// The last-will a bus client for `service` must register: its offline
/// state with status `STOPPED`, retained on its state topic.
///
/// # Errors
///
/// Returns an error if the service name is invalid or the offline state
/// cannot be encoded.
pub fn offline_last_will<S>(service: &S, topic_prefix: &str) -> Result<LastWill>
where
    S: Service,
{
    validate_name(service.name())?;

    let payload = ServiceMessage::stopped(service.offline_state()).to_bytes()?;

    Ok(LastWill::new(
        state_topic(topic_prefix, service.name()),
        payload,
        true,
    ))
}

/// Drives a [`Service`] through its lifecycle.
pub struct StateManager<S, B> {
    context: ServiceContext<B>,
    dependencies: Vec<String>,
    last_will: LastWill,
    lifecycle: watch::Sender<Lifecycle>,
    service: Arc<S>,
}

impl<S, B> fmt::Debug for StateManager<S, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("dependencies", &self.dependencies)
            .field("lifecycle", &*self.lifecycle.borrow())
            .finish_non_exhaustive()
    }
}

impl<S, B> StateManager<S, B>
where
    S: Service,
    B: BusClient,
{
    /// Creates a new `StateManager`. The service's declared dependencies are
    /// extended with those configured under `[services.<name>]`, and its
    /// offline state is prepared as the last-will registered on connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the service or a dependency name is not a single
    /// topic segment, the bus session is named differently, or the offline
    /// state cannot be encoded.
    pub fn new(context: ServiceContext<B>, service: Arc<S>) -> Result<Self> {
        let name = service.name();
        validate_name(name)?;

        if context.bus().name() != name {
            return Err(Error::NameMismatch {
                service: name.to_string(),
                bus: context.bus().name().to_string(),
            });
        }

        let mut dependencies = service.dependencies();
        dependencies.extend(context.config().dependencies_for(name).iter().cloned());

        let mut seen = BTreeSet::new();
        dependencies.retain(|dependency| seen.insert(dependency.clone()));

        for dependency in &dependencies {
            validate_name(dependency)?;
        }

        let last_will = offline_last_will(service.as_ref(), &context.config().bus.topic_prefix)?;

        let (lifecycle, _) = watch::channel(Lifecycle::Init);

        Ok(Self {
            context,
            dependencies,
            last_will,
            lifecycle,
            service,
        })
    }

    /// Observe lifecycle transitions.
    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// The halt token. Cancelling it stops the service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown_token()
    }

    /// Resolved dependencies.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn transition(&self, next: Lifecycle) {
        info!("`{}` is {}", self.service.name(), next);
        self.lifecycle.send_replace(next);
    }

    /// Run the service until it is halted.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting fails, a dependency subscription or
    /// request registration fails, or the main routine fails or returns
    /// without a halt. After a successful connect the offline state is
    /// still published and the bus disconnected.
    pub async fn run(self) -> Result<()> {
        let name = self.service.name().to_string();
        let bus = self.context.bus().clone();

        self.transition(Lifecycle::Connecting);
        if let Err(e) = bus.connect(Some(self.last_will.clone())).await {
            error!("`{}` failed to connect to the bus: {}", name, e);
            self.transition(Lifecycle::Stopped);
            return Err(Error::connect(e));
        }

        let tracker = DependencyTracker::new(self.dependencies.clone());
        let handle = ServiceHandle::new(self.context.clone(), name.clone(), tracker.clone());

        let result = self.run_connected(&handle, &tracker).await;
        if let Err(e) = &result {
            error!("`{}` failed: {}", name, e);
        }

        self.transition(Lifecycle::Stopping);
        self.context.halt();
        self.context.task_tracker().close();
        self.context.task_tracker().wait().await;

        if let Err(e) = handle.publish_offline(self.service.offline_state()).await {
            warn!("`{}` failed to publish its offline state: {}", name, e);
        }

        if let Err(e) = bus.disconnect().await {
            warn!("`{}` failed to disconnect cleanly: {}", name, e);
        }

        self.transition(Lifecycle::Stopped);

        result
    }

    async fn run_connected(
        &self,
        handle: &ServiceHandle<S::State, B>,
        tracker: &DependencyTracker,
    ) -> Result<()> {
        self.transition(Lifecycle::AwaitingDependencies);

        tracker
            .subscribe(self.context.bus(), &self.context.config().bus.topic_prefix)
            .await
            .map_err(Error::bus)?;

        if !self.wait_for_dependencies(tracker).await {
            info!("halted while waiting for dependencies");
            return Ok(());
        }

        self.service.clone().register(handle).await?;

        self.transition(Lifecycle::Running);

        if self.service.halt_on_dependency_loss() {
            self.watch_dependency_loss(handle);
        }

        match self.service.clone().main(handle.clone()).await {
            Ok(()) if handle.is_halted() => Ok(()),
            Ok(()) => Err(Error::MainExited),
            Err(e) => Err(Error::Main(e)),
        }
    }

    /// Returns `false` if halted before every dependency ran.
    async fn wait_for_dependencies(&self, tracker: &DependencyTracker) -> bool {
        if !tracker.dependencies().is_empty() {
            info!(
                "waiting for dependencies: {}",
                tracker.dependencies().join(", ")
            );
        }

        let shutdown_token = self.context.shutdown_token();
        let period = self.context.config().lifecycle.dependency_log_interval();
        let mut ticker = interval_at(Instant::now() + period, period);

        let satisfied = tracker.wait_all_satisfied();
        tokio::pin!(satisfied);

        loop {
            tokio::select! {
                biased;
                () = shutdown_token.cancelled() => return false,
                () = &mut satisfied => return true,
                _ = ticker.tick() => {
                    info!("still waiting for {}", tracker.missing().join(", "));
                }
            }
        }
    }

    fn watch_dependency_loss(&self, handle: &ServiceHandle<S::State, B>) {
        let handle = handle.clone();
        let shutdown_token = self.context.shutdown_token();

        self.context.task_tracker().spawn(async move {
            tokio::select! {
                () = shutdown_token.cancelled() => {}
                lost = handle.wait_dependency_lost() => {
                    warn!("lost dependencies {}, halting", lost.join(", "));
                    handle.halt();
                }
            }
        });
    }
}
