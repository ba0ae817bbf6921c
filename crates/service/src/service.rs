use crate::error::{BoxError, Result};
use crate::handle::ServiceHandle;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_bus::BusClient;
use serde::Serialize;

/// A daemon that owns one piece of state and publishes it on the bus.
///
/// A `StateManager` drives the lifecycle: it connects, waits for every
/// dependency to run, calls [`Service::register`], then runs
/// [`Service::main`] until halted and finally publishes
/// [`Service::offline_state`].
#[async_trait]
pub trait Service
where
    Self: Sized + Send + Sync + 'static,
{
    /// The state the service publishes.
    type State: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Unique service name, used as the root of the service's topics.
    fn name(&self) -> &str;

    /// Services that must be running before `main` starts.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// State published with `STOPPED`, both on shutdown and as last-will.
    /// Dependents must be safe when they see it.
    fn offline_state(&self) -> Option<Self::State>;

    /// Whether losing a running dependency halts the service.
    fn halt_on_dependency_loss(&self) -> bool {
        false
    }

    /// Register request handlers. Called once dependencies are satisfied,
    /// before `main`.
    ///
    /// # Errors
    ///
    /// A failed registration is fatal.
    async fn register<B>(self: Arc<Self>, _handle: &ServiceHandle<Self::State, B>) -> Result<()>
    where
        B: BusClient,
    {
        Ok(())
    }

    /// The service's main routine. It must run until the handle is halted
    /// and then return `Ok`.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the process.
    async fn main<B>(self: Arc<Self>, handle: ServiceHandle<Self::State, B>) -> Result<(), BoxError>
    where
        B: BusClient;
}
