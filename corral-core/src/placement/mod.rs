//! The placement engine.
//!
//! Computes the best possible assignment of a resource's partition replicas to nodes. The
//! computation is a pure function of its input: identical inputs always produce identical
//! assignments, so independent controllers converge on the same decision.

#[cfg(test)]
mod mod_test;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{ClusterConfig, IdealState, InstanceConfig, PartitionAssignment, RebalanceMode, Replica, ResourceAssignment};
use crate::statemodel::StateModelDefinition;
use crate::topology::ClusterTopology;

pub const METRIC_FROZEN_PARTITIONS: &str = "corral_frozen_partitions";

/// The input of a best possible computation.
#[derive(Clone, Copy)]
pub struct PlacementInput<'a> {
    /// The resource being placed.
    pub ideal_state: &'a IdealState,
    /// The state model of the resource.
    pub definition: &'a StateModelDefinition,
    /// The cluster config, carrying the delay and error threshold policies.
    pub cluster: &'a ClusterConfig,
    /// The fault zones of the cluster.
    pub topology: &'a ClusterTopology,
    /// All configured nodes.
    pub instances: &'a BTreeMap<String, InstanceConfig>,
    /// The nodes which are currently live.
    pub live_nodes: &'a BTreeSet<String>,
    /// The last time each offline node went offline, in epoch millis.
    pub offline_since: &'a BTreeMap<String, u64>,
    /// The observed states of the resource's replicas, partition to node to state.
    pub current_states: &'a BTreeMap<String, BTreeMap<String, String>>,
    /// The previous best possible assignment of the resource, if any.
    pub previous: Option<&'a ResourceAssignment>,
    /// The time of this computation, in epoch millis.
    pub now_ms: u64,
}

/// The output of a best possible computation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlacementOutput {
    /// The best possible assignment.
    pub assignment: ResourceAssignment,
    /// Partitions whose error replicas exceed the error threshold, held at their previous assignment.
    pub frozen_partitions: Vec<String>,
    /// The earliest time at which the delay window of an offline node expires.
    pub next_rebalance_at_ms: Option<u64>,
}

/// Compute the best possible assignment of a resource.
#[tracing::instrument(level = "debug", skip(input), fields(resource = %input.ideal_state.resource_name))]
pub fn compute_best_possible(input: &PlacementInput) -> PlacementOutput {
    let nodes = NodeSets::new(input);
    let mut output = PlacementOutput {
        assignment: ResourceAssignment::new(input.ideal_state.resource_name.clone()),
        frozen_partitions: vec![],
        next_rebalance_at_ms: nodes.next_rebalance_at_ms,
    };
    let partitions = input.ideal_state.partition_names();
    match input.ideal_state.rebalance_mode {
        RebalanceMode::FullAuto => full_auto(input, &nodes, &partitions, &mut output),
        RebalanceMode::SemiAuto => {
            for partition in partitions.iter() {
                let preference_list: Vec<String> = input
                    .ideal_state
                    .preference_lists
                    .get(partition)
                    .map(|list| list.iter().filter(|node| nodes.active.contains(*node)).cloned().collect())
                    .unwrap_or_default();
                let assignment = assign_roles(input, &nodes, partition, preference_list);
                output.assignment.partitions.insert(partition.clone(), assignment);
            }
        }
        RebalanceMode::Customized => {
            for partition in partitions.iter() {
                output.assignment.partitions.insert(partition.clone(), customized(input, &nodes, partition));
            }
        }
    }
    metrics::gauge!(
        METRIC_FROZEN_PARTITIONS,
        output.frozen_partitions.len() as f64,
        "resource" => input.ideal_state.resource_name.clone()
    );
    if !output.frozen_partitions.is_empty() {
        tracing::warn!(
            resource = %input.ideal_state.resource_name,
            partitions = ?output.frozen_partitions,
            "error replicas exceed threshold, automatic placement paused for partitions"
        );
    }
    output
}

/// The node sets derived from the input.
struct NodeSets {
    /// Enabled configured nodes which are live.
    live: BTreeSet<String>,
    /// Live nodes plus offline nodes still within their delay window.
    active: BTreeSet<String>,
    /// The earliest delay window expiry.
    next_rebalance_at_ms: Option<u64>,
}

impl NodeSets {
    fn new(input: &PlacementInput) -> Self {
        let enabled = input.instances.values().filter(|instance| instance.enabled).map(|instance| &instance.instance_name);
        let (mut live, mut active, mut next_rebalance_at_ms) = (BTreeSet::new(), BTreeSet::new(), None::<u64>);
        let window = input.cluster.delay_window_ms();
        for node in enabled {
            if input.live_nodes.contains(node) {
                live.insert(node.clone());
                active.insert(node.clone());
                continue;
            }
            let expiry = match (window, input.offline_since.get(node)) {
                (Some(window), Some(since)) => since.saturating_add(window),
                _ => continue,
            };
            if expiry > input.now_ms {
                active.insert(node.clone());
                next_rebalance_at_ms = Some(next_rebalance_at_ms.map_or(expiry, |val| val.min(expiry)));
            }
        }
        Self {
            live,
            active,
            next_rebalance_at_ms,
        }
    }
}

/// The observed error nodes of a partition.
fn error_nodes(input: &PlacementInput, partition: &str) -> BTreeSet<String> {
    input
        .current_states
        .get(partition)
        .map(|states| {
            states
                .iter()
                .filter(|(_, state)| state.as_str() == input.definition.error_state())
                .map(|(node, _)| node.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn placement_hash(partition: &str, node: &str) -> u64 {
    seahash::hash(format!("{}/{}", partition, node).as_bytes())
}

fn full_auto(input: &PlacementInput, nodes: &NodeSets, partitions: &[String], output: &mut PlacementOutput) {
    let replicas = input.ideal_state.replicas as usize;
    let total = partitions.len() * replicas;
    let capacity = if nodes.active.is_empty() {
        0
    } else {
        (total + nodes.active.len() - 1) / nodes.active.len()
    };
    let zone_of = |node: &str| input.topology.zone_of(node).unwrap_or(node).to_string();
    let previous_list = |partition: &str| -> Vec<String> {
        input
            .previous
            .and_then(|prev| prev.partitions.get(partition))
            .map(|assignment| assignment.preference_list.clone())
            .unwrap_or_default()
    };

    // Partitions which keep their previous assignment or membership verbatim.
    let threshold = input.cluster.error_partition_threshold_for_load_balance as usize;
    let mut frozen = BTreeMap::new();
    let mut pinned = BTreeMap::new();
    for partition in partitions.iter() {
        let errors = error_nodes(input, partition).len();
        let previous = match input.previous.and_then(|prev| prev.partitions.get(partition)) {
            Some(previous) => previous,
            None => continue,
        };
        if errors > threshold {
            frozen.insert(partition.clone(), previous.clone());
        } else if errors > 0 && input.cluster.error_blocks_membership_change {
            pinned.insert(partition.clone(), previous.preference_list.clone());
        }
    }

    let mut load: HashMap<String, usize> = nodes.active.iter().map(|node| (node.clone(), 0)).collect();
    for assignment in frozen.values() {
        for node in assignment.preference_list.iter() {
            if let Some(val) = load.get_mut(node) {
                *val += 1;
            }
        }
    }
    for list in pinned.values() {
        for node in list.iter() {
            if let Some(val) = load.get_mut(node) {
                *val += 1;
            }
        }
    }

    // Replicas of one partition spread evenly over the zones of the active nodes. With at least
    // as many zones as replicas that is one replica per zone.
    let active_zones: BTreeSet<String> = nodes.active.iter().map(|node| zone_of(node)).collect();
    let zone_limit = if active_zones.is_empty() {
        replicas
    } else {
        (replicas + active_zones.len() - 1) / active_zones.len()
    };

    // Sticky pass. Keep previous active nodes in order, within the per zone limit.
    let mut lists: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for partition in partitions.iter() {
        if frozen.contains_key(partition) {
            continue;
        }
        if let Some(list) = pinned.get(partition) {
            lists.insert(partition.clone(), list.clone());
            continue;
        }
        let mut list = vec![];
        let mut zones = ZoneCounts::new();
        for node in previous_list(partition) {
            if list.len() >= replicas || !nodes.active.contains(&node) {
                continue;
            }
            let used = zones.entry(zone_of(&node)).or_insert(0);
            if *used >= zone_limit {
                continue;
            }
            *used += 1;
            *load.entry(node.clone()).or_insert(0) += 1;
            list.push(node);
        }
        lists.insert(partition.clone(), list);
    }

    // Shed pass. Move replicas off nodes above capacity, one at a time, preferring replicas at
    // the tail of a preference list so that top states stay put.
    let overloaded: Vec<String> = nodes.active.iter().filter(|node| load.get(*node).copied().unwrap_or(0) > capacity).cloned().collect();
    for node in overloaded {
        let mut candidates: Vec<(usize, String)> = lists
            .iter()
            .filter(|(partition, _)| !pinned.contains_key(*partition))
            .filter_map(|(partition, list)| list.iter().position(|val| val == &node).map(|pos| (pos, partition.clone())))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for (pos, partition) in candidates {
            if load.get(&node).copied().unwrap_or(0) <= capacity {
                break;
            }
            let list = match lists.get_mut(&partition) {
                Some(list) => list,
                None => continue,
            };
            let zones = zone_counts(list.iter().filter(|val| *val != &node), &zone_of);
            let target = match pick_node(&partition, list.as_slice(), &zones, &nodes.live, &load, capacity, &zone_of) {
                Some(target)
                    if load.get(&target).copied().unwrap_or(0) < capacity
                        && zones.get(&zone_of(&target)).copied().unwrap_or(0) < zone_limit =>
                {
                    target
                }
                _ => continue,
            };
            *load.entry(target.clone()).or_insert(0) += 1;
            if let Some(val) = load.get_mut(&node) {
                *val -= 1;
            }
            list[pos] = target;
        }
    }

    // Fill pass. Only live nodes receive new replicas.
    for partition in partitions.iter() {
        if pinned.contains_key(partition) {
            continue;
        }
        let list = match lists.get_mut(partition) {
            Some(list) => list,
            None => continue,
        };
        let mut zones = zone_counts(list.iter(), &zone_of);
        while list.len() < replicas {
            match pick_node(partition, list.as_slice(), &zones, &nodes.live, &load, capacity, &zone_of) {
                Some(node) => {
                    *zones.entry(zone_of(&node)).or_insert(0) += 1;
                    *load.entry(node.clone()).or_insert(0) += 1;
                    list.push(node);
                }
                None => break,
            }
        }

        // Keep at least the minimum number of live replicas, regardless of delayed nodes.
        let min_active = input.ideal_state.min_active_replicas as usize;
        while list.iter().filter(|node| nodes.live.contains(*node)).count() < min_active {
            match pick_node(partition, list.as_slice(), &zones, &nodes.live, &load, capacity, &zone_of) {
                Some(node) => {
                    *zones.entry(zone_of(&node)).or_insert(0) += 1;
                    *load.entry(node.clone()).or_insert(0) += 1;
                    list.push(node);
                }
                None => break,
            }
        }
    }

    for partition in partitions.iter() {
        let assignment = match frozen.remove(partition) {
            Some(mut previous) => {
                let errors = error_nodes(input, partition);
                for replica in previous.replicas.iter_mut().filter(|replica| errors.contains(&replica.node)) {
                    replica.state = input.definition.error_state().to_string();
                }
                output.frozen_partitions.push(partition.clone());
                previous
            }
            None => assign_roles(input, nodes, partition, lists.remove(partition).unwrap_or_default()),
        };
        output.assignment.partitions.insert(partition.clone(), assignment);
    }
}

/// Zone to the number of a partition's replicas within it.
type ZoneCounts = BTreeMap<String, usize>;

fn zone_counts<'a>(nodes: impl Iterator<Item = &'a String>, zone_of: &dyn Fn(&str) -> String) -> ZoneCounts {
    let mut counts = ZoneCounts::new();
    for node in nodes {
        *counts.entry(zone_of(node)).or_insert(0) += 1;
    }
    counts
}

/// Pick the next node for a partition: least used zone first, then under capacity, then least
/// loaded, ties broken by a stable hash of the partition and node.
fn pick_node(
    partition: &str, list: &[String], zones: &ZoneCounts, candidates: &BTreeSet<String>, load: &HashMap<String, usize>, capacity: usize,
    zone_of: &dyn Fn(&str) -> String,
) -> Option<String> {
    candidates
        .iter()
        .filter(|node| !list.contains(*node))
        .min_by_key(|node| {
            let zone_used = zones.get(&zone_of(node)).copied().unwrap_or(0);
            let node_load = load.get(*node).copied().unwrap_or(0);
            (zone_used, node_load >= capacity, node_load, placement_hash(partition, node))
        })
        .cloned()
}

/// Assign states to a preference list.
///
/// Error replicas keep their error state and never take the top state, delayed offline nodes
/// get no replica, remaining live nodes take states by priority within each state's bound.
fn assign_roles(input: &PlacementInput, nodes: &NodeSets, partition: &str, preference_list: Vec<String>) -> PartitionAssignment {
    let errors = error_nodes(input, partition);
    let mut bounds = input.definition.placement_states(input.ideal_state.replicas);
    let mut replicas = vec![];
    for node in preference_list.iter() {
        if !nodes.live.contains(node) {
            continue;
        }
        if errors.contains(node) {
            replicas.push(Replica::new(node.clone(), input.definition.error_state()));
            continue;
        }
        let state = match bounds.iter_mut().find(|(_, bound)| *bound > 0) {
            Some((state, bound)) => {
                *bound -= 1;
                state.clone()
            }
            None => input.definition.initial_state().to_string(),
        };
        replicas.push(Replica::new(node.clone(), state));
    }
    PartitionAssignment { preference_list, replicas }
}

/// Follow the supplied node to state map, limited to live nodes and the replica factor.
fn customized(input: &PlacementInput, nodes: &NodeSets, partition: &str) -> PartitionAssignment {
    let errors = error_nodes(input, partition);
    let mut entries: Vec<(&String, &String)> = input
        .ideal_state
        .map_fields
        .get(partition)
        .map(|map| map.iter().filter(|(node, _)| nodes.live.contains(*node)).collect())
        .unwrap_or_default();
    let priority = |state: &str| input.definition.priority(state).unwrap_or(usize::MAX);
    entries.sort_by_key(|(node, state)| (priority(state), (*node).clone()));
    entries.truncate(input.ideal_state.replicas as usize);
    let replicas: Vec<Replica> = entries
        .into_iter()
        .map(|(node, state)| {
            if errors.contains(node) {
                Replica::new(node.clone(), input.definition.error_state())
            } else {
                Replica::new(node.clone(), state.clone())
            }
        })
        .collect();
    PartitionAssignment {
        preference_list: replicas.iter().map(|replica| replica.node.clone()).collect(),
        replicas,
    }
}
