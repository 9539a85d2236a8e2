use std::collections::BTreeMap;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The topology key used when topology aware placement is disabled.
pub const DEFAULT_TOPOLOGY_KEY: &str = "instance";
/// The separator used between segments of a topology string.
pub const TOPOLOGY_PATH_SEPARATOR: &str = "/";

lazy_static! {
    /// A single `key=value` pair of an instance domain string.
    static ref DOMAIN_PAIR: Regex = Regex::new(r"^\s*([^=,\s]+)\s*=\s*([^=,]*?)\s*$").expect("invalid domain pair regex");
}

fn default_true() -> bool {
    true
}

/// Cluster level configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterConfig {
    /// The name of the cluster.
    pub cluster_name: String,
    /// The topology path template of the cluster, e.g. `/zone/host/instance`.
    #[serde(default)]
    pub topology: Option<String>,
    /// The topology key used as the fault zone, e.g. `zone`.
    #[serde(default)]
    pub fault_zone_type: Option<String>,
    /// Enable topology aware placement.
    #[serde(default)]
    pub topology_aware_enabled: bool,
    /// The number of ERROR replicas a partition may carry before automatic placement of that
    /// partition is paused.
    #[serde(default)]
    pub error_partition_threshold_for_load_balance: u32,
    /// Enable delayed replacement of offline nodes.
    #[serde(default)]
    pub delay_rebalance_enabled: bool,
    /// The delay window applied to offline nodes, in milliseconds.
    #[serde(default)]
    pub delay_rebalance_time_ms: u64,
    /// Persist the computed best possible assignment of each resource.
    #[serde(default)]
    pub persist_best_possible_assignment: bool,
    /// When set, any ERROR replica of a partition pins the membership of that partition's
    /// preference list, not just its top state.
    #[serde(default)]
    pub error_blocks_membership_change: bool,
}

impl ClusterConfig {
    /// Create a new cluster config with default values.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    /// The effective delay window, `None` when delayed rebalancing is disabled.
    pub fn delay_window_ms(&self) -> Option<u64> {
        if self.delay_rebalance_enabled && self.delay_rebalance_time_ms > 0 {
            Some(self.delay_rebalance_time_ms)
        } else {
            None
        }
    }
}

/// A view of the topology related fields of a `ClusterConfig`.
///
/// This is always derived from the config on read and is never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopologyConfig {
    /// Whether topology aware placement is enabled.
    pub topology_aware: bool,
    /// The ordered keys of the topology path.
    pub topology_keys: Vec<String>,
    /// The key used to group nodes into fault zones.
    pub fault_zone_type: String,
    /// The last key of the topology path, identifying a single node.
    pub end_node_type: String,
}

impl ClusterTopologyConfig {
    /// Derive the topology view of the given cluster config.
    pub fn from_cluster_config(config: &ClusterConfig) -> Result<Self> {
        if !config.topology_aware_enabled {
            return Ok(Self {
                topology_aware: false,
                topology_keys: vec![DEFAULT_TOPOLOGY_KEY.into()],
                fault_zone_type: DEFAULT_TOPOLOGY_KEY.into(),
                end_node_type: DEFAULT_TOPOLOGY_KEY.into(),
            });
        }
        let topology_keys: Vec<String> = config
            .topology
            .as_deref()
            .unwrap_or_default()
            .split(TOPOLOGY_PATH_SEPARATOR)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(String::from)
            .collect();
        let end_node_type = match topology_keys.last() {
            Some(key) => key.clone(),
            None => {
                return Err(AppError::InvalidArgument(format!(
                    "topology aware placement is enabled on cluster {} but its topology string is empty",
                    config.cluster_name
                ))
                .into())
            }
        };
        let fault_zone_type = match config.fault_zone_type.as_deref().filter(|val| !val.is_empty()) {
            Some(key) if topology_keys.iter().any(|k| k == key) => key.to_string(),
            Some(key) => {
                return Err(AppError::InvalidArgument(format!(
                    "fault zone type {} is not a segment of topology {:?}",
                    key, config.topology
                ))
                .into())
            }
            None => end_node_type.clone(),
        };
        Ok(Self {
            topology_aware: true,
            topology_keys,
            fault_zone_type,
            end_node_type,
        })
    }
}

/// Per node configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InstanceConfig {
    /// The unique name of the node.
    pub instance_name: String,
    /// The node's host.
    #[serde(default)]
    pub host: String,
    /// The node's port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Whether the node may be assigned replicas.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// The node's topology domain, formatted as `key=value,key=value`.
    #[serde(default)]
    pub domain: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl InstanceConfig {
    /// Create a new enabled instance config.
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            enabled: true,
            ..Default::default()
        }
    }

    /// Parse the node's domain string into a map.
    ///
    /// Malformed pairs are skipped.
    pub fn domain_as_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for pair in self.domain.as_deref().unwrap_or_default().split(',') {
            if pair.trim().is_empty() {
                continue;
            }
            match DOMAIN_PAIR.captures(pair) {
                Some(caps) => {
                    map.insert(caps[1].to_string(), caps[2].to_string());
                }
                None => tracing::warn!(instance = %self.instance_name, pair, "skipping malformed domain pair"),
            }
        }
        map
    }

    /// Set the node's domain from the given map.
    pub fn set_domain(&mut self, domain: &BTreeMap<String, String>) {
        let joined = domain.iter().map(|(key, val)| format!("{}={}", key, val)).collect::<Vec<_>>().join(",");
        self.domain = Some(joined);
    }
}

/// The liveness record of a node, stored as an ephemeral node owned by the node's session.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LiveInstance {
    /// The name of the live node.
    pub instance_name: String,
    /// The session which owns the record.
    pub session_id: String,
}

/// Liveness history of a node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InstanceHistory {
    /// The last time the node joined the cluster, in epoch millis.
    #[serde(default)]
    pub last_online_ms: Option<u64>,
    /// The last time the node left the cluster, in epoch millis.
    #[serde(default)]
    pub last_offline_ms: Option<u64>,
}

/// The actor which put the cluster into maintenance mode.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceTrigger {
    /// An operator or admin operation.
    User,
    /// The controller itself.
    Controller,
}

/// The record present in the store while a cluster is in maintenance mode.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MaintenanceSignal {
    /// Why maintenance mode was entered.
    pub reason: String,
    /// Who entered maintenance mode.
    pub triggered_by: MaintenanceTrigger,
    /// When maintenance mode was entered, in epoch millis.
    pub timestamp_ms: u64,
    /// Caller supplied fields.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}
