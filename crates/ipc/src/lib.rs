//! Wire types shared by fleet services: the state envelope, request and
//! response payloads, and the disk service's state and requests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod disk;
mod error;
mod request;
mod status;

pub use disk::{
    AddStaticDiskRequest, DiskInfo, DiskState, DiskType, DiskUuid, METADATA_FILE,
    RemoveAllStaticDisksRequest, RemoveStaticDiskRequest,
};
pub use error::{Error, Result};
pub use request::{ManagerRequest, RequestResponse, new_request_id};
pub use status::{ServiceMessage, ServiceStatus};
