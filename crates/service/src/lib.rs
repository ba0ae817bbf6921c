//! The service lifecycle shared by every fleet daemon: dependency gating,
//! retained state publication, request handling and cooperative shutdown.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod consumer;
mod context;
mod dependency;
mod error;
mod handle;
mod manager;
mod request;
mod service;
pub mod signal;
pub mod topics;

pub use consumer::StateConsumer;
pub use context::ServiceContext;
pub use dependency::DependencyTracker;
pub use error::{BoxError, Error, Result};
pub use handle::ServiceHandle;
pub use manager::{Lifecycle, StateManager, offline_last_will};
pub use request::{Rejection, decode_request};
pub use service::Service;
