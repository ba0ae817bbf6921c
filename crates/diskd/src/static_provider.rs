use crate::provider::{ChangeNotifier, DiskMap, DiskProvider};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_ipc::DiskUuid;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// The stable identifier of the static disk at `path`.
#[must_use]
pub fn static_disk_id(path: &Path) -> DiskUuid {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, path.as_os_str().as_encoded_bytes());
    DiskUuid::new(format!("static-{id}"))
}

/// Operator-managed disks: the configured static paths plus any added at
/// runtime through requests.
#[derive(Debug, Default)]
pub struct StaticDiskProvider {
    paths: RwLock<BTreeSet<PathBuf>>,
}

impl StaticDiskProvider {
    /// Creates a new `StaticDiskProvider` reporting `paths`.
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: RwLock::new(paths.into_iter().collect()),
        }
    }

    /// Add `path`. Returns `false` if it was already present.
    pub fn add(&self, path: PathBuf) -> bool {
        let added = self.paths.write().insert(path.clone());
        if added {
            info!("added static disk {}", path.display());
        }
        added
    }

    /// Remove `path`. Returns `false` if it was not present.
    pub fn remove(&self, path: &Path) -> bool {
        let removed = self.paths.write().remove(path);
        if removed {
            info!("removed static disk {}", path.display());
        }
        removed
    }

    /// Remove every static disk, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut paths = self.paths.write();
        let count = paths.len();
        paths.clear();
        info!("removed {} static disks", count);
        count
    }
}

#[async_trait]
impl DiskProvider for StaticDiskProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    fn disks(&self) -> DiskMap {
        self.paths
            .read()
            .iter()
            .map(|path| (static_disk_id(path), path.clone()))
            .collect()
    }

    async fn run(self: Arc<Self>, _notifier: ChangeNotifier, _shutdown_token: CancellationToken) {}
}
