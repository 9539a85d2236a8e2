use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The rebalance mode of a resource.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceMode {
    /// Both replica placement and states are computed by the controller.
    FullAuto,
    /// Placement follows the supplied preference lists, states are computed by the controller.
    SemiAuto,
    /// Placement and states follow the supplied map.
    Customized,
}

/// The definition of a partitioned, replicated resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct IdealState {
    /// The name of the resource.
    pub resource_name: String,
    /// The number of partitions of the resource.
    pub num_partitions: u32,
    /// The replica factor of each partition.
    pub replicas: u32,
    /// The minimum number of live replicas which must be kept even during a delay window.
    #[serde(default)]
    pub min_active_replicas: u32,
    /// The name of the state model governing replicas of this resource.
    pub state_model_def_ref: String,
    /// The rebalance mode of the resource.
    pub rebalance_mode: RebalanceMode,
    /// Preference lists used in `SemiAuto` mode, keyed by partition.
    #[serde(default)]
    pub preference_lists: BTreeMap<String, Vec<String>>,
    /// Node to state maps used in `Customized` mode, keyed by partition.
    #[serde(default)]
    pub map_fields: BTreeMap<String, BTreeMap<String, String>>,
}

impl IdealState {
    /// Create a new resource definition.
    pub fn new(resource_name: impl Into<String>, num_partitions: u32, replicas: u32, state_model: impl Into<String>, rebalance_mode: RebalanceMode) -> Self {
        Self {
            resource_name: resource_name.into(),
            num_partitions,
            replicas,
            min_active_replicas: 0,
            state_model_def_ref: state_model.into(),
            rebalance_mode,
            preference_lists: Default::default(),
            map_fields: Default::default(),
        }
    }

    /// The name of the partition at the given index.
    pub fn partition_name(&self, index: u32) -> String {
        format!("{}_{}", self.resource_name, index)
    }

    /// The names of all partitions of this resource.
    pub fn partition_names(&self) -> Vec<String> {
        (0..self.num_partitions).map(|idx| self.partition_name(idx)).collect()
    }
}

/// The states of one resource's replicas hosted on one node, as reported by that node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CurrentState {
    /// The name of the resource.
    pub resource_name: String,
    /// The session of the node which reported these states.
    pub session_id: String,
    /// Partition to state.
    #[serde(default)]
    pub partition_states: BTreeMap<String, String>,
}

/// The externally observed placement of a resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ExternalView {
    /// The name of the resource.
    pub resource_name: String,
    /// Partition to node to state.
    #[serde(default)]
    pub partitions: BTreeMap<String, BTreeMap<String, String>>,
}

impl ExternalView {
    /// Aggregate the current states reported by live nodes into an external view.
    pub fn aggregate<'a>(resource_name: &str, current_states: impl IntoIterator<Item = (&'a String, &'a CurrentState)>) -> Self {
        let mut view = Self {
            resource_name: resource_name.to_string(),
            partitions: Default::default(),
        };
        for (node, current) in current_states {
            for (partition, state) in current.partition_states.iter() {
                view.partitions
                    .entry(partition.clone())
                    .or_default()
                    .insert(node.clone(), state.clone());
            }
        }
        view
    }
}

/// A single replica of a partition.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct Replica {
    /// The node hosting the replica.
    pub node: String,
    /// The state of the replica.
    pub state: String,
}

impl Replica {
    pub fn new(node: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: state.into(),
        }
    }
}

/// The computed placement of a single partition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PartitionAssignment {
    /// The ordered nodes selected for this partition, including nodes which are offline but
    /// still within their delay window.
    pub preference_list: Vec<String>,
    /// The ordered replicas with their roles, covering only nodes which should host a replica now.
    pub replicas: Vec<Replica>,
}

impl PartitionAssignment {
    /// The replicas of this partition as a node to state map.
    pub fn state_map(&self) -> BTreeMap<String, String> {
        self.replicas.iter().map(|replica| (replica.node.clone(), replica.state.clone())).collect()
    }
}

/// The best possible assignment of a resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ResourceAssignment {
    /// The name of the resource.
    pub resource_name: String,
    /// Partition to assignment.
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionAssignment>,
}

impl ResourceAssignment {
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            partitions: Default::default(),
        }
    }

    /// The node to state map of the given partition, empty when the partition is unknown.
    pub fn state_map(&self, partition: &str) -> BTreeMap<String, String> {
        self.partitions.get(partition).map(PartitionAssignment::state_map).unwrap_or_default()
    }
}
