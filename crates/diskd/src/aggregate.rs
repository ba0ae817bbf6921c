use crate::provider::{DiskMap, DiskProvider};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use fleet_ipc::DiskState;
use tracing::info;

/// Merge every provider's disks in order. A later provider overwrites an
/// earlier one reporting the same disk; ignored mount paths are dropped.
#[must_use]
pub fn merge_disks(providers: &[Arc<dyn DiskProvider>], ignored: &BTreeSet<PathBuf>) -> DiskState {
    let mut disks = DiskMap::new();

    for provider in providers {
        for (uuid, mount_path) in provider.disks() {
            if ignored.contains(&mount_path) {
                info!("ignoring {} as it is an ignored mount", mount_path.display());
                continue;
            }
            disks.insert(uuid, mount_path);
        }
    }

    DiskState { disks }
}
