use crate::aggregate::merge_disks;
use crate::error::Error;
use crate::mount_provider::MountWatcherProvider;
use crate::provider::{ChangeNotifier, DiskProvider};
use crate::static_provider::StaticDiskProvider;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_bus::BusClient;
use fleet_config::DiskdConfig;
use fleet_ipc::{
    AddStaticDiskRequest, DiskState, RemoveAllStaticDisksRequest, RemoveStaticDiskRequest,
    RequestResponse,
};
use fleet_service::{BoxError, Service, ServiceHandle};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The disk service.
///
/// Reports the union of its providers' disks, minus ignored mounts, as a
/// [`DiskState`]. Static disks can be added and removed at runtime with the
/// `add_static`, `remove_static` and `remove_all_static` requests.
#[derive(Debug)]
pub struct DiskManager {
    changes: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    ignored_mounts: BTreeSet<PathBuf>,
    name: String,
    notifier: ChangeNotifier,
    providers: Vec<Arc<dyn DiskProvider>>,
    static_disks: Arc<StaticDiskProvider>,
}

impl DiskManager {
    /// Creates a disk manager with the static provider followed by
    /// `providers`, in that order.
    pub fn new(
        name: impl Into<String>,
        ignored_mounts: impl IntoIterator<Item = PathBuf>,
        static_disks: Arc<StaticDiskProvider>,
        providers: impl IntoIterator<Item = Arc<dyn DiskProvider>>,
    ) -> Self {
        let (notifier, changes) = ChangeNotifier::channel();

        let mut all: Vec<Arc<dyn DiskProvider>> = Vec::new();
        all.push(static_disks.clone());
        all.extend(providers);

        Self {
            changes: Mutex::new(Some(changes)),
            ignored_mounts: ignored_mounts.into_iter().collect(),
            name: name.into(),
            notifier,
            providers: all,
            static_disks,
        }
    }

    /// Creates a disk manager from the `[diskd]` configuration section. The
    /// mount watcher is added only if the by-uuid directory exists.
    #[must_use]
    pub fn from_config(config: &DiskdConfig) -> Self {
        let static_disks = Arc::new(StaticDiskProvider::new(config.static_disks.clone()));

        let mut providers: Vec<Arc<dyn DiskProvider>> = Vec::new();
        let mounts = MountWatcherProvider::from_config(config);
        if mounts.is_available() {
            providers.push(Arc::new(mounts));
        } else {
            info!(
                "{} not found, not watching mounted disks",
                config.by_uuid_dir.display()
            );
        }

        Self::new(
            config.name.clone(),
            config.ignored_mounts.clone(),
            static_disks,
            providers,
        )
    }

    /// The current aggregate.
    #[must_use]
    pub fn current(&self) -> DiskState {
        merge_disks(&self.providers, &self.ignored_mounts)
    }

    fn add_static(&self, request: &AddStaticDiskRequest) -> RequestResponse {
        if !request.path.is_dir() {
            return RequestResponse::failure(
                &request.uuid,
                format!("{} is not a directory", request.path.display()),
            );
        }

        if !self.static_disks.add(request.path.clone()) {
            return RequestResponse::failure(
                &request.uuid,
                format!("{} is already a static disk", request.path.display()),
            );
        }

        self.notifier.notify();
        RequestResponse::success(&request.uuid)
    }

    fn remove_static(&self, request: &RemoveStaticDiskRequest) -> RequestResponse {
        if !self.static_disks.remove(&request.path) {
            return RequestResponse::failure(
                &request.uuid,
                format!("{} is not a static disk", request.path.display()),
            );
        }

        self.notifier.notify();
        RequestResponse::success(&request.uuid)
    }

    fn remove_all_static(&self, request: &RemoveAllStaticDisksRequest) -> RequestResponse {
        if self.static_disks.clear() > 0 {
            self.notifier.notify();
        }

        RequestResponse::success(&request.uuid)
    }
}

#[async_trait]
impl Service for DiskManager {
    type State = DiskState;

    fn name(&self) -> &str {
        &self.name
    }

    fn offline_state(&self) -> Option<DiskState> {
        Some(DiskState::default())
    }

    async fn register<B>(
        self: Arc<Self>,
        handle: &ServiceHandle<DiskState, B>,
    ) -> fleet_service::Result<()>
    where
        B: BusClient,
    {
        let manager = self.clone();
        handle
            .register_request("add_static", move |request: AddStaticDiskRequest| {
                let response = manager.add_static(&request);
                async move { response }
            })
            .await?;

        let manager = self.clone();
        handle
            .register_request("remove_static", move |request: RemoveStaticDiskRequest| {
                let response = manager.remove_static(&request);
                async move { response }
            })
            .await?;

        let manager = self;
        handle
            .register_request(
                "remove_all_static",
                move |request: RemoveAllStaticDisksRequest| {
                    let response = manager.remove_all_static(&request);
                    async move { response }
                },
            )
            .await
    }

    async fn main<B>(self: Arc<Self>, handle: ServiceHandle<DiskState, B>) -> Result<(), BoxError>
    where
        B: BusClient,
    {
        let Some(mut changes) = self.changes.lock().take() else {
            return Err(Error::AlreadyRunning.into());
        };

        for provider in &self.providers {
            debug!("starting {} disk provider", provider.name());
            handle.spawn(
                provider
                    .clone()
                    .run(self.notifier.clone(), handle.shutdown_token()),
            );
        }

        handle.set_state(self.current()).await?;

        let shutdown_token = handle.shutdown_token();
        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                change = changes.recv() => {
                    if change.is_none() {
                        break;
                    }
                    while changes.try_recv().is_ok() {}

                    let state = self.current();
                    info!("disks changed: {} mounted", state.disks.len());
                    handle.set_state(state).await?;
                }
            }
        }

        Ok(())
    }
}
