use std::sync::Arc;

use fleet_bus::BusClient;
use fleet_config::FleetConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Per-process context handed to a `StateManager`: the bus client, the
/// configuration, the halt token and the tracker for spawned tasks.
#[derive(Clone, Debug)]
pub struct ServiceContext<B> {
    bus: B,
    config: Arc<FleetConfig>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<B> ServiceContext<B>
where
    B: BusClient,
{
    /// Creates a new `ServiceContext` with a fresh halt token.
    pub fn new(bus: B, config: impl Into<Arc<FleetConfig>>) -> Self {
        Self::with_shutdown_token(bus, config, CancellationToken::new())
    }

    /// Creates a new `ServiceContext` halted by `shutdown_token`.
    pub fn with_shutdown_token(
        bus: B,
        config: impl Into<Arc<FleetConfig>>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            bus,
            config: config.into(),
            shutdown_token,
            task_tracker: TaskTracker::new(),
        }
    }

    /// The bus client.
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// The configuration.
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// The halt token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Tracker for every task spawned on behalf of the service.
    pub const fn task_tracker(&self) -> &TaskTracker {
        &self.task_tracker
    }

    /// Request a cooperative halt.
    pub fn halt(&self) {
        if !self.shutdown_token.is_cancelled() {
            info!("halting");
        }
        self.shutdown_token.cancel();
    }
}
