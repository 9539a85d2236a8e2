//! Cluster topology snapshots.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::models::{ClusterConfig, ClusterTopologyConfig, InstanceConfig};

/// An immutable view of the fault zones of a cluster and the nodes within them.
///
/// When topology aware placement is disabled every node is its own fault zone. A node whose
/// domain lacks the fault zone key is likewise placed in a zone of its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    config: ClusterTopologyConfig,
    /// Zone to member nodes.
    zones: BTreeMap<String, BTreeSet<String>>,
    /// Node to zone.
    node_zones: BTreeMap<String, String>,
}

impl ClusterTopology {
    /// Build the topology of the given nodes.
    pub fn new<'a>(config: ClusterTopologyConfig, instances: impl IntoIterator<Item = &'a InstanceConfig>) -> Self {
        let (mut zones, mut node_zones) = (BTreeMap::<String, BTreeSet<String>>::new(), BTreeMap::new());
        for instance in instances {
            let zone = if config.topology_aware {
                match instance.domain_as_map().remove(&config.fault_zone_type) {
                    Some(zone) if !zone.is_empty() => zone,
                    _ => {
                        tracing::warn!(
                            instance = %instance.instance_name,
                            fault_zone_type = %config.fault_zone_type,
                            "instance domain has no fault zone, placing it in a zone of its own"
                        );
                        instance.instance_name.clone()
                    }
                }
            } else {
                instance.instance_name.clone()
            };
            zones.entry(zone.clone()).or_default().insert(instance.instance_name.clone());
            node_zones.insert(instance.instance_name.clone(), zone);
        }
        Self { config, zones, node_zones }
    }

    /// Build the topology of a cluster from its config and instance configs.
    pub fn from_cluster(cluster: &ClusterConfig, instances: &BTreeMap<String, InstanceConfig>) -> Result<Self> {
        let config = ClusterTopologyConfig::from_cluster_config(cluster)?;
        Ok(Self::new(config, instances.values()))
    }

    /// The topology config this snapshot was built with.
    pub fn config(&self) -> &ClusterTopologyConfig {
        &self.config
    }

    /// Whether zones are derived from node domains.
    pub fn is_zone_aware(&self) -> bool {
        self.config.topology_aware
    }

    /// The fault zone of the given node.
    pub fn zone_of(&self, node: &str) -> Option<&str> {
        self.node_zones.get(node).map(String::as_str)
    }

    /// Zone to member nodes.
    pub fn zones(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.zones
    }

    /// All nodes of the topology.
    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        self.node_zones.keys()
    }
}
