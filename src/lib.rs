#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Subnet lease allocation and route synchronization for container-network
//! overlays.
//!
//! Each cluster member registers the subnet it was assigned as a lease in a
//! shared store, watches the other members' leases, and keeps its kernel
//! routing table converged with what the watch reports.

pub mod backend;
pub mod config;
pub mod error;
pub mod ip;
pub mod lease;
pub mod manager;
pub mod registry;
pub mod routes;
pub mod watch;

pub mod test_utils;

pub use error::{Error, Result};
