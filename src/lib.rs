//! fleetscout: a pooled SSH access layer for inspecting a fleet of
//! remote machines.
//!
//! An external agent addresses hosts by symbolic name and gets a
//! uniform request/response surface for reading files, listing
//! directories, running a constrained set of commands, and reading
//! service state (containers, ZFS, system logs). All remote I/O goes
//! through long-lived pooled SSH sessions.

pub mod auth;
pub mod config;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod limit;
pub mod pipeline;
pub mod pool;
pub mod probe;
pub mod scout;
pub mod validate;

pub use config::Config;
pub use error::ScoutError;
pub use inventory::{HostInventory, HostRecord, StaticInventory};
pub use pipeline::{Pipeline, Request, RequestContext};
pub use pool::SshPool;
pub use scout::{Scout, ScoutParams};
