// src/core/mod.rs

//! The central module containing the core logic and data structures of Fleetd.

pub mod address;
pub mod application;
pub mod clock;
pub mod commander;
pub mod context;
pub mod errors;
pub mod events;
pub mod placement;
pub mod plan;
pub mod process;
pub mod remote;

pub use commander::{Commander, Starter, Stopper};
pub use context::Context;
pub use errors::FleetdError;
