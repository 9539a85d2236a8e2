//! Data models persisted in the coordination store.
//!
//! All models are stored as JSON documents. Paths for each model are built by
//! `crate::paths::PathBuilder`.

mod cluster;
mod resource;

pub use cluster::{ClusterConfig, ClusterTopologyConfig, InstanceConfig, InstanceHistory, LiveInstance, MaintenanceSignal, MaintenanceTrigger, TOPOLOGY_PATH_SEPARATOR};
pub use resource::{CurrentState, ExternalView, IdealState, PartitionAssignment, RebalanceMode, Replica, ResourceAssignment};
