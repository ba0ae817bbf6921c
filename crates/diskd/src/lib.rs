//! Disk service: aggregates the disks reported by a list of providers and
//! publishes the result as its retained state.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod aggregate;
mod error;
mod manager;
mod mount_provider;
mod provider;
mod static_provider;

pub use aggregate::merge_disks;
pub use error::Error;
pub use manager::DiskManager;
pub use mount_provider::{MountWatcherProvider, parse_mounts};
pub use provider::{ChangeNotifier, DiskMap, DiskProvider};
pub use static_provider::{StaticDiskProvider, static_disk_id};
