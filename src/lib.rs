/// Baremetal - dedicated server provider core
///
/// Manages Selectel dedicated servers through the v2 and legacy APIs:
/// retrying transport, typed resource service, status waiters and the
/// reconciliation handlers built on top of them.
pub mod api;
pub mod config;
pub mod error;
pub mod partitions;
pub mod provider;
pub mod waiter;

pub use error::{Error, Result};
