use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_bus::{BusClient, BusMessage};
use fleet_bus_memory::{MemoryBroker, MemoryBusClient, MemoryBusClientOptions};
use fleet_config::FleetConfig;
use fleet_diskd::{DiskManager, DiskProvider, StaticDiskProvider, static_disk_id};
use fleet_ipc::{
    AddStaticDiskRequest, DiskState, RemoveAllStaticDisksRequest, RemoveStaticDiskRequest,
    RequestResponse, ServiceMessage, ServiceStatus,
};
use fleet_service::{Lifecycle, ServiceContext, StateConsumer, StateManager};
use serde::Serialize;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn client(broker: &MemoryBroker, name: &str) -> MemoryBusClient {
    MemoryBusClient::new(
        broker.clone(),
        MemoryBusClientOptions {
            name: name.to_string(),
        },
    )
}

struct Requester {
    bus: MemoryBusClient,
    responses: mpsc::UnboundedReceiver<BusMessage>,
}

impl Requester {
    async fn new(broker: &MemoryBroker) -> Self {
        let bus = client(broker, "requester");
        bus.connect(None).await.unwrap();

        let (sender, responses) = mpsc::unbounded_channel();
        bus.subscribe("diskd/request/+/+", move |message: BusMessage| {
            let sender = sender.clone();
            async move {
                let _ = sender.send(message);
            }
        })
        .await
        .unwrap();

        Self { bus, responses }
    }

    async fn request<R: Serialize>(&mut self, kind: &str, request: &R) -> RequestResponse {
        self.bus
            .publish(
                &format!("diskd/request/{kind}"),
                Bytes::from(serde_json::to_vec(request).unwrap()),
                false,
            )
            .await
            .unwrap();

        let message = timeout(Duration::from_secs(1), self.responses.recv())
            .await
            .expect("no response")
            .unwrap();

        serde_json::from_slice(&message.payload).unwrap()
    }
}

fn has_disks(paths: &[&Path]) -> impl FnMut(&ServiceMessage<DiskState>) -> bool {
    let expected: Vec<PathBuf> = paths.iter().map(|path| path.to_path_buf()).collect();
    move |message| {
        message.is_running()
            && message.state.as_ref().is_some_and(|state| {
                state.disks.len() == expected.len()
                    && expected
                        .iter()
                        .all(|path| state.disks.get(&static_disk_id(path)) == Some(path))
            })
    }
}

#[tokio::test]
async fn test_static_disk_requests_update_state() {
    let usercode = tempdir().unwrap();
    let extra = tempdir().unwrap();

    let broker = MemoryBroker::new();
    let service = Arc::new(DiskManager::new(
        "diskd",
        [PathBuf::from("/")],
        Arc::new(StaticDiskProvider::new([
            usercode.path().to_path_buf(),
            PathBuf::from("/"),
        ])),
        Vec::<Arc<dyn DiskProvider>>::new(),
    ));

    let context = ServiceContext::new(client(&broker, "diskd"), FleetConfig::default());
    let manager = StateManager::new(context, service).unwrap();
    let shutdown_token = manager.shutdown_token();
    let mut lifecycle = manager.lifecycle();
    let task = tokio::spawn(manager.run());

    timeout(
        Duration::from_secs(1),
        lifecycle.wait_for(|state| *state == Lifecycle::Running),
    )
    .await
    .expect("diskd never ran")
    .unwrap();

    let observer = client(&broker, "observer");
    observer.connect(None).await.unwrap();
    let mut disks = StateConsumer::<DiskState>::start(&observer, "", "diskd")
        .await
        .unwrap();

    timeout(
        Duration::from_secs(1),
        disks.wait_for(has_disks(&[usercode.path()])),
    )
    .await
    .expect("initial disks never published")
    .unwrap();

    let mut requester = Requester::new(&broker).await;

    let add = AddStaticDiskRequest::new(extra.path());
    assert_eq!(
        requester.request("add_static", &add).await,
        RequestResponse::success(&add.uuid)
    );
    timeout(
        Duration::from_secs(1),
        disks.wait_for(has_disks(&[usercode.path(), extra.path()])),
    )
    .await
    .expect("added disk never published")
    .unwrap();

    let duplicate = AddStaticDiskRequest::new(extra.path());
    assert_ne!(duplicate.uuid, add.uuid);
    let response = requester.request("add_static", &duplicate).await;
    assert_eq!(response.uuid, duplicate.uuid);
    assert!(!response.success);

    let remove = RemoveStaticDiskRequest::new(usercode.path());
    assert!(requester.request("remove_static", &remove).await.success);
    timeout(
        Duration::from_secs(1),
        disks.wait_for(has_disks(&[extra.path()])),
    )
    .await
    .expect("removed disk still published")
    .unwrap();

    let clear = RemoveAllStaticDisksRequest::default();
    assert!(requester.request("remove_all_static", &clear).await.success);
    timeout(Duration::from_secs(1), disks.wait_for(has_disks(&[])))
        .await
        .expect("disks never cleared")
        .unwrap();

    shutdown_token.cancel();
    timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let offline =
        ServiceMessage::<DiskState>::from_slice(&broker.retained("diskd").unwrap()).unwrap();
    assert_eq!(offline.status, ServiceStatus::Stopped);
    assert_eq!(offline.state, Some(DiskState::default()));
}

#[tokio::test]
async fn test_last_will_reports_no_disks() {
    let disk = tempdir().unwrap();
    let service = Arc::new(DiskManager::new(
        "diskd",
        Vec::<PathBuf>::new(),
        Arc::new(StaticDiskProvider::new([disk.path().to_path_buf()])),
        Vec::<Arc<dyn DiskProvider>>::new(),
    ));

    let broker = MemoryBroker::new();
    let bus = client(&broker, "diskd");
    let abort = bus.clone();

    let context = ServiceContext::new(bus, FleetConfig::default());
    let manager = StateManager::new(context, service).unwrap();
    let mut lifecycle = manager.lifecycle();
    let _task = tokio::spawn(manager.run());

    timeout(
        Duration::from_secs(1),
        lifecycle.wait_for(|state| *state == Lifecycle::Running),
    )
    .await
    .expect("diskd never ran")
    .unwrap();

    abort.abort();

    let retained =
        ServiceMessage::<DiskState>::from_slice(&broker.retained("diskd").unwrap()).unwrap();
    assert_eq!(retained.status, ServiceStatus::Stopped);
    assert_eq!(retained.state, Some(DiskState::default()));
}
