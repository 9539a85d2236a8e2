//! Corral cluster management core.
//!
//! Partition state machines, replica placement, virtual topology grouping, convergence
//! verification and the config commit protocol, all coordinated through a versioned
//! coordination store.

pub mod commit;
pub mod controller;
pub mod engine;
pub mod error;
pub mod fixtures;
pub mod maintenance;
pub mod models;
pub mod participant;
pub mod paths;
pub mod placement;
pub mod snapshot;
pub mod statemodel;
pub mod store;
pub mod topology;
pub mod utils;
pub mod verifier;
#[cfg(test)]
mod verifier_test;
pub mod vtopology;

pub use error::{AppError, StoreError};
