use crate::request::{ManagerRequest, new_request_id};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File marking a disk as carrying metadata.
pub const METADATA_FILE: &str = "metadata.json";

/// Opaque identifier of a disk, usually a filesystem UUID.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct DiskUuid(String);

impl DiskUuid {
    /// Creates a new `DiskUuid`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DiskUuid {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DiskUuid {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a mounted disk is for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskType {
    /// Carries user code to run.
    Usercode,

    /// Carries metadata for the running code.
    Metadata,

    /// Nothing to do.
    Noaction,
}

impl DiskType {
    /// Classify the disk mounted at `mount_path` by the marker files at its
    /// root. User code takes precedence over metadata.
    #[must_use]
    pub fn determine(mount_path: &Path, usercode_entrypoint: &str) -> Self {
        if mount_path.join(usercode_entrypoint).is_file() {
            Self::Usercode
        } else if mount_path.join(METADATA_FILE).is_file() {
            Self::Metadata
        } else {
            Self::Noaction
        }
    }
}

/// Derived information about one mounted disk.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiskInfo {
    /// The disk's identifier.
    pub uuid: DiskUuid,

    /// Where the disk is mounted.
    pub mount_path: PathBuf,

    /// What the disk is for.
    pub disk_type: DiskType,
}

/// State published by the disk service: every visible disk and its mount
/// path.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiskState {
    /// Mounted disks by identifier.
    pub disks: BTreeMap<DiskUuid, PathBuf>,
}

impl DiskState {
    /// Classify every disk in the state.
    #[must_use]
    pub fn calculate_disk_info(&self, usercode_entrypoint: &str) -> BTreeMap<DiskUuid, DiskInfo> {
        self.disks
            .iter()
            .map(|(uuid, path)| {
                (
                    uuid.clone(),
                    DiskInfo {
                        uuid: uuid.clone(),
                        mount_path: path.clone(),
                        disk_type: DiskType::determine(path, usercode_entrypoint),
                    },
                )
            })
            .collect()
    }
}

/// Add a static disk at `path`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddStaticDiskRequest {
    /// Correlation id.
    pub uuid: String,

    /// Mount path of the disk.
    pub path: PathBuf,
}

impl AddStaticDiskRequest {
    /// A request with a fresh correlation id.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            uuid: new_request_id(),
            path: path.into(),
        }
    }
}

impl ManagerRequest for AddStaticDiskRequest {
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Remove the static disk at `path`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoveStaticDiskRequest {
    /// Correlation id.
    pub uuid: String,

    /// Mount path of the disk.
    pub path: PathBuf,
}

impl RemoveStaticDiskRequest {
    /// A request with a fresh correlation id.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            uuid: new_request_id(),
            path: path.into(),
        }
    }
}

impl ManagerRequest for RemoveStaticDiskRequest {
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Remove every static disk.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoveAllStaticDisksRequest {
    /// Correlation id.
    pub uuid: String,
}

impl Default for RemoveAllStaticDisksRequest {
    fn default() -> Self {
        Self {
            uuid: new_request_id(),
        }
    }
}

impl ManagerRequest for RemoveAllStaticDisksRequest {
    fn uuid(&self) -> &str {
        &self.uuid
    }
}
