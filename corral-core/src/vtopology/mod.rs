//! Virtual topology groups.
//!
//! A virtualization layer on top of the physical fault zones of a cluster. Physical nodes are
//! mapped into a requested number of virtual groups, which then act as the cluster's fault zones.

mod service;

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{ClusterConfig, ClusterTopologyConfig, TOPOLOGY_PATH_SEPARATOR};

pub use self::service::{VirtualTopologyGroupRequest, VirtualTopologyGroupService};

/// The suffix of a virtual fault zone key.
pub const VIRTUAL_FAULT_ZONE_SUFFIX: &str = "_virtualZone";
/// The virtual fault zone key used when a cluster has no fault zone type.
pub const VIRTUAL_FAULT_ZONE: &str = "virtualZone";

/// A mapping of zone or group name to member nodes.
pub type ZoneMapping = BTreeMap<String, BTreeSet<String>>;

/// The virtual fault zone key derived from a fault zone type.
///
/// A key which is already virtual is returned unchanged.
pub fn virtual_fault_zone_key(fault_zone_type: Option<&str>) -> String {
    match fault_zone_type.filter(|key| !key.is_empty()) {
        None => VIRTUAL_FAULT_ZONE.into(),
        Some(key) if is_virtual_key(key) => key.into(),
        Some(key) => format!("{}{}", key, VIRTUAL_FAULT_ZONE_SUFFIX),
    }
}

/// The physical fault zone key of a possibly virtual key.
///
/// Returns `None` for the bare virtual key, which has no physical counterpart.
pub fn physical_fault_zone_key(key: &str) -> Option<String> {
    if key == VIRTUAL_FAULT_ZONE {
        return None;
    }
    Some(key.strip_suffix(VIRTUAL_FAULT_ZONE_SUFFIX).unwrap_or(key).to_string())
}

fn is_virtual_key(key: &str) -> bool {
    key == VIRTUAL_FAULT_ZONE || key.ends_with(VIRTUAL_FAULT_ZONE_SUFFIX)
}

/// Rewrite the cluster's topology string, replacing its fault zone segment with the virtual
/// fault zone key.
pub fn compute_virtual_topology_string(config: &ClusterConfig) -> Result<String> {
    let topology = match config.topology.as_deref().filter(|val| !val.is_empty()) {
        Some(topology) => topology,
        None => return Err(AppError::InvalidArgument("topology string cannot be empty".into()).into()),
    };
    let topology_config = ClusterTopologyConfig::from_cluster_config(config)?;
    let virtual_key = virtual_fault_zone_key(config.fault_zone_type.as_deref());
    let segments: Vec<&str> = topology
        .split(TOPOLOGY_PATH_SEPARATOR)
        .map(|segment| if segment == topology_config.fault_zone_type { virtual_key.as_str() } else { segment })
        .collect();
    Ok(segments.join(TOPOLOGY_PATH_SEPARATOR))
}

/// The name of the virtual group at the given index.
pub fn group_name(prefix: &str, index: usize) -> String {
    format!("{}_{}", prefix, index)
}

/// The available assignment algorithms.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentAlgorithmType {
    InstanceBased,
    ZoneBased,
}

impl Default for AssignmentAlgorithmType {
    fn default() -> Self {
        Self::InstanceBased
    }
}

impl FromStr for AssignmentAlgorithmType {
    type Err = anyhow::Error;

    fn from_str(val: &str) -> Result<Self> {
        match val {
            "INSTANCE_BASED" => Ok(Self::InstanceBased),
            "ZONE_BASED" => Ok(Self::ZoneBased),
            _ => Err(AppError::InvalidArgument(format!("unsupported assignment algorithm {}", val)).into()),
        }
    }
}

impl AssignmentAlgorithmType {
    /// The algorithm implementing this type.
    pub fn algorithm(&self) -> &'static dyn VirtualGroupAssignment {
        match self {
            Self::InstanceBased => &InstanceBasedAssignment,
            Self::ZoneBased => &ZoneBasedAssignment,
        }
    }
}

/// An algorithm mapping physical nodes into virtual groups.
///
/// Callers validate `num_groups` before invoking an algorithm.
pub trait VirtualGroupAssignment: Send + Sync {
    /// Compute the mapping of group name to member nodes.
    ///
    /// `existing` holds the current virtual groups and is empty when recomputing from scratch.
    fn compute_assignment(&self, num_groups: usize, prefix: &str, physical: &ZoneMapping, existing: &ZoneMapping) -> ZoneMapping;
}

/// Fresh, empty groups.
fn empty_groups(num_groups: usize, prefix: &str) -> Vec<(String, BTreeSet<String>)> {
    (0..num_groups).map(|idx| (group_name(prefix, idx), BTreeSet::new())).collect()
}

/// The index of the group with the fewest nodes, lowest index on ties.
fn smallest_group(groups: &[(String, BTreeSet<String>)]) -> usize {
    groups
        .iter()
        .enumerate()
        .min_by_key(|(idx, (_, members))| (members.len(), *idx))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Round-robins nodes into groups.
#[derive(Clone, Copy, Debug, Default)]
pub struct InstanceBasedAssignment;

impl VirtualGroupAssignment for InstanceBasedAssignment {
    fn compute_assignment(&self, num_groups: usize, prefix: &str, physical: &ZoneMapping, existing: &ZoneMapping) -> ZoneMapping {
        let nodes: Vec<&String> = physical.values().flatten().collect();
        let mut groups = empty_groups(num_groups, prefix);
        if num_groups == 0 {
            return groups.into_iter().collect();
        }

        // Keep every node whose current group is still valid.
        let mut assigned = BTreeSet::new();
        for (name, members) in groups.iter_mut() {
            let previous = match existing.get(name) {
                Some(previous) => previous,
                None => continue,
            };
            for node in previous.iter().filter(|node| nodes.contains(node)) {
                if assigned.insert(node.clone()) {
                    members.insert(node.clone());
                }
            }
        }

        if assigned.is_empty() {
            for (idx, node) in nodes.iter().enumerate() {
                groups[idx % num_groups].1.insert((*node).clone());
            }
            return groups.into_iter().collect();
        }
        for node in nodes.iter().filter(|node| !assigned.contains(**node)) {
            let idx = smallest_group(&groups);
            groups[idx].1.insert((*node).clone());
        }
        if groups.iter().any(|(_, members)| members.is_empty()) {
            return self.compute_assignment(num_groups, prefix, physical, &ZoneMapping::new());
        }
        groups.into_iter().collect()
    }
}

/// Builds each group from whole physical zones.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZoneBasedAssignment;

impl VirtualGroupAssignment for ZoneBasedAssignment {
    fn compute_assignment(&self, num_groups: usize, prefix: &str, physical: &ZoneMapping, existing: &ZoneMapping) -> ZoneMapping {
        let mut groups = empty_groups(num_groups, prefix);
        if num_groups == 0 {
            return groups.into_iter().collect();
        }
        let group_of: BTreeMap<&String, usize> = groups
            .iter()
            .enumerate()
            .filter_map(|(idx, (name, _))| existing.get(name).map(|members| (idx, members)))
            .flat_map(|(idx, members)| members.iter().map(move |node| (node, idx)))
            .collect();

        let mut zones: Vec<(&String, &BTreeSet<String>)> = physical.iter().collect();
        zones.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
        let mut remaining = vec![];
        for (zone, members) in zones {
            let previous: BTreeSet<Option<usize>> = members.iter().map(|node| group_of.get(node).copied()).collect();
            match previous.iter().next() {
                Some(Some(idx)) if previous.len() == 1 => groups[*idx].1.extend(members.iter().cloned()),
                _ => remaining.push((zone, members)),
            }
        }
        let has_prior = remaining.len() < physical.len();
        for (_, members) in remaining {
            let idx = smallest_group(&groups);
            groups[idx].1.extend(members.iter().cloned());
        }
        if has_prior && groups.iter().any(|(_, members)| members.is_empty()) {
            return self.compute_assignment(num_groups, prefix, physical, &ZoneMapping::new());
        }
        groups.into_iter().collect()
    }
}
