use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rand::Rng;

use crate::models::{ClusterConfig, IdealState, InstanceConfig, RebalanceMode, ResourceAssignment};
use crate::placement::{compute_best_possible, PlacementInput, PlacementOutput};
use crate::statemodel::{StateModelDefinition, MASTER_SLAVE, STATE_ERROR, STATE_MASTER, STATE_SLAVE};
use crate::topology::ClusterTopology;

const DELAY_MS: u64 = 10_000;

/// A cluster fixture for placement computations.
struct TestCluster {
    config: ClusterConfig,
    instances: BTreeMap<String, InstanceConfig>,
    live: BTreeSet<String>,
    offline_since: BTreeMap<String, u64>,
    current: BTreeMap<String, BTreeMap<String, String>>,
    definition: StateModelDefinition,
    ideal: IdealState,
}

impl TestCluster {
    fn new(nodes: usize, partitions: u32, replicas: u32) -> Self {
        let mut cluster = Self {
            config: ClusterConfig::new("test"),
            instances: BTreeMap::new(),
            live: BTreeSet::new(),
            offline_since: BTreeMap::new(),
            current: BTreeMap::new(),
            definition: StateModelDefinition::master_slave(),
            ideal: IdealState::new("db", partitions, replicas, MASTER_SLAVE, RebalanceMode::FullAuto),
        };
        for idx in 0..nodes {
            cluster.add_node(&format!("node-{}", idx));
        }
        cluster
    }

    fn add_node(&mut self, name: &str) {
        self.instances.insert(name.into(), InstanceConfig::new(name));
        self.live.insert(name.into());
        self.offline_since.remove(name);
    }

    fn stop_node(&mut self, name: &str, at_ms: u64) {
        self.live.remove(name);
        self.offline_since.insert(name.into(), at_ms);
    }

    fn compute(&self, previous: Option<&ResourceAssignment>, now_ms: u64) -> Result<PlacementOutput> {
        let topology = ClusterTopology::from_cluster(&self.config, &self.instances)?;
        Ok(compute_best_possible(&PlacementInput {
            ideal_state: &self.ideal,
            definition: &self.definition,
            cluster: &self.config,
            topology: &topology,
            instances: &self.instances,
            live_nodes: &self.live,
            offline_since: &self.offline_since,
            current_states: &self.current,
            previous,
            now_ms,
        }))
    }
}

fn node_loads(assignment: &ResourceAssignment) -> BTreeMap<String, usize> {
    let mut loads = BTreeMap::new();
    for partition in assignment.partitions.values() {
        for node in partition.preference_list.iter() {
            *loads.entry(node.clone()).or_insert(0) += 1;
        }
    }
    loads
}

fn master_of(assignment: &ResourceAssignment, partition: &str) -> Option<String> {
    assignment.partitions.get(partition).and_then(|partition| {
        partition
            .replicas
            .iter()
            .find(|replica| replica.state == STATE_MASTER)
            .map(|replica| replica.node.clone())
    })
}

#[test]
fn best_possible_is_deterministic_and_balanced() -> Result<()> {
    let cluster = TestCluster::new(4, 12, 3);

    let first = cluster.compute(None, 0)?;
    let second = cluster.compute(None, 0)?;
    let third = cluster.compute(Some(&first.assignment), 0)?;

    assert_eq!(first, second, "expected identical inputs to yield identical assignments");
    assert_eq!(first.assignment, third.assignment, "expected recompute against own output to be stable");
    for (name, partition) in first.assignment.partitions.iter() {
        let nodes: BTreeSet<&String> = partition.preference_list.iter().collect();
        assert_eq!(nodes.len(), 3, "expected 3 distinct nodes for {}, got {:?}", name, partition.preference_list);
        let masters = partition.replicas.iter().filter(|replica| replica.state == STATE_MASTER).count();
        let slaves = partition.replicas.iter().filter(|replica| replica.state == STATE_SLAVE).count();
        assert_eq!((masters, slaves), (1, 2), "unexpected roles for {}: {:?}", name, partition.replicas);
        assert_eq!(partition.replicas[0].state, STATE_MASTER, "expected the first node of {} to be master", name);
    }
    for (node, load) in node_loads(&first.assignment) {
        assert_eq!(load, 9, "expected every node to hold 9 replicas, {} holds {}", node, load);
    }
    Ok(())
}

#[test]
fn adding_a_node_moves_only_replicas_onto_it() -> Result<()> {
    let mut cluster = TestCluster::new(4, 12, 3);
    let before = cluster.compute(None, 0)?;

    cluster.add_node("node-4");
    let after = cluster.compute(Some(&before.assignment), 0)?;

    let mut moved = 0;
    let mut master_changes = 0;
    for (name, partition) in after.assignment.partitions.iter() {
        let previous = before.assignment.partitions.get(name).context("missing partition in previous assignment")?;
        for node in partition.preference_list.iter().filter(|node| !previous.preference_list.contains(node)) {
            assert_eq!(node, "node-4", "expected only the new node to gain replicas, {} gained {}", name, node);
            moved += 1;
        }
        if master_of(&after.assignment, name) != master_of(&before.assignment, name) {
            master_changes += 1;
        }
        assert_eq!(partition.replicas.len(), 3, "expected {} to keep 3 replicas", name);
    }
    let new_load = node_loads(&after.assignment).get("node-4").copied().unwrap_or(0);
    assert!(moved > 0, "expected the new node to receive replicas");
    assert_eq!(moved, new_load, "expected moved replicas to equal the new node's load");
    assert!(new_load <= 8, "expected the new node to stay within capacity, got {}", new_load);
    assert!(master_changes <= moved, "expected at most {} master changes, got {}", moved, master_changes);
    Ok(())
}

#[test]
fn replicas_are_spread_across_fault_zones() -> Result<()> {
    let mut cluster = TestCluster::new(0, 8, 3);
    cluster.config.topology_aware_enabled = true;
    cluster.config.topology = Some("/zone/instance".into());
    cluster.config.fault_zone_type = Some("zone".into());
    for idx in 0..6 {
        let name = format!("node-{}", idx);
        cluster.add_node(&name);
        let instance = cluster.instances.get_mut(&name).context("missing instance")?;
        instance.domain = Some(format!("zone=z{},instance={}", idx % 3, name));
    }
    let topology = ClusterTopology::from_cluster(&cluster.config, &cluster.instances)?;

    let output = cluster.compute(None, 0)?;

    for (name, partition) in output.assignment.partitions.iter() {
        let zones: BTreeSet<&str> = partition.preference_list.iter().filter_map(|node| topology.zone_of(node)).collect();
        assert_eq!(zones.len(), 3, "expected {} to span 3 zones, got {:?}", name, partition.preference_list);
    }
    Ok(())
}

#[test]
fn fewer_zones_than_replicas_still_fills_every_slot() -> Result<()> {
    let mut cluster = TestCluster::new(0, 6, 3);
    cluster.config.topology_aware_enabled = true;
    cluster.config.topology = Some("/zone/instance".into());
    cluster.config.fault_zone_type = Some("zone".into());
    for idx in 0..4 {
        let name = format!("node-{}", idx);
        cluster.add_node(&name);
        let instance = cluster.instances.get_mut(&name).context("missing instance")?;
        instance.domain = Some(format!("zone=z{},instance={}", idx % 2, name));
    }
    let topology = ClusterTopology::from_cluster(&cluster.config, &cluster.instances)?;

    let first = cluster.compute(None, 0)?;
    let second = cluster.compute(Some(&first.assignment), 0)?;

    assert_eq!(first.assignment, second.assignment, "expected recompute against own output to be stable");
    for (name, partition) in first.assignment.partitions.iter() {
        assert_eq!(partition.replicas.len(), 3, "expected 3 replicas for {}, got {:?}", name, partition.replicas);
        let zones: BTreeSet<&str> = partition.preference_list.iter().filter_map(|node| topology.zone_of(node)).collect();
        assert_eq!(zones.len(), 2, "expected {} to span both zones, got {:?}", name, partition.preference_list);
    }
    Ok(())
}

#[test]
fn partitions_over_error_threshold_are_frozen() -> Result<()> {
    let mut cluster = TestCluster::new(4, 4, 3);
    let before = cluster.compute(None, 0)?;
    let frozen_partition = "db_0";
    let previous = before.assignment.partitions.get(frozen_partition).context("missing partition")?.clone();
    let error_node = previous.preference_list[1].clone();
    cluster
        .current
        .entry(frozen_partition.into())
        .or_default()
        .insert(error_node.clone(), STATE_ERROR.into());
    cluster.stop_node(&previous.preference_list[2], 0);

    let after = cluster.compute(Some(&before.assignment), 0)?;

    assert_eq!(after.frozen_partitions, vec![frozen_partition.to_string()], "unexpected frozen partitions");
    let frozen = after.assignment.partitions.get(frozen_partition).context("missing partition")?;
    assert_eq!(frozen.preference_list, previous.preference_list, "expected frozen partition to keep its placement");
    assert_eq!(frozen.state_map().get(&error_node).map(String::as_str), Some(STATE_ERROR), "expected error replica to be reported");

    // Under a higher threshold the partition heals, keeping the error replica out of the top state.
    cluster.config.error_partition_threshold_for_load_balance = 5;
    let healed = cluster.compute(Some(&before.assignment), 0)?;
    assert!(healed.frozen_partitions.is_empty(), "expected no frozen partitions, got {:?}", healed.frozen_partitions);
    let partition = healed.assignment.partitions.get(frozen_partition).context("missing partition")?;
    assert_eq!(partition.replicas.len(), 3, "expected partition to be repopulated, got {:?}", partition.replicas);
    assert_eq!(partition.state_map().get(&error_node).map(String::as_str), Some(STATE_ERROR), "expected error replica to stay in error");
    assert_ne!(master_of(&healed.assignment, frozen_partition), Some(error_node), "expected error replica to never be master");
    Ok(())
}

#[test]
fn error_replicas_pin_membership_under_policy_flag() -> Result<()> {
    let mut cluster = TestCluster::new(4, 4, 3);
    cluster.config.error_partition_threshold_for_load_balance = 5;
    cluster.config.error_blocks_membership_change = true;
    let before = cluster.compute(None, 0)?;
    let previous = before.assignment.partitions.get("db_1").context("missing partition")?.clone();
    cluster
        .current
        .entry("db_1".into())
        .or_default()
        .insert(previous.preference_list[0].clone(), STATE_ERROR.into());
    cluster.stop_node(&previous.preference_list[2], 0);

    let after = cluster.compute(Some(&before.assignment), 0)?;

    let partition = after.assignment.partitions.get("db_1").context("missing partition")?;
    assert_eq!(partition.preference_list, previous.preference_list, "expected membership to be pinned");
    assert_eq!(partition.replicas.len(), 2, "expected the stopped node to get no replica, got {:?}", partition.replicas);
    assert_eq!(
        master_of(&after.assignment, "db_1").as_deref(),
        Some(previous.preference_list[1].as_str()),
        "expected roles to be recomputed around the error replica"
    );
    Ok(())
}

#[test]
fn delayed_node_keeps_its_slot_and_regains_its_role() -> Result<()> {
    let mut cluster = TestCluster::new(4, 8, 3);
    cluster.config.delay_rebalance_enabled = true;
    cluster.config.delay_rebalance_time_ms = DELAY_MS;
    let before = cluster.compute(None, 0)?;
    let master = master_of(&before.assignment, "db_0").context("expected db_0 to have a master")?;

    cluster.stop_node(&master, 1_000);
    let during = cluster.compute(Some(&before.assignment), 2_000)?;

    assert_eq!(during.next_rebalance_at_ms, Some(1_000 + DELAY_MS), "unexpected next rebalance time");
    for (name, partition) in during.assignment.partitions.iter() {
        let previous = before.assignment.partitions.get(name).context("missing partition")?;
        assert_eq!(partition.preference_list, previous.preference_list, "expected no reassignment of {} during the delay window", name);
        assert!(partition.state_map().get(&master).is_none(), "expected the offline node to hold no replica of {}", name);
    }
    let promoted = master_of(&during.assignment, "db_0").context("expected a live replica to be promoted")?;
    assert_ne!(promoted, master, "expected a live replica to take the top state");

    cluster.add_node(&master);
    let returned = cluster.compute(Some(&during.assignment), 3_000)?;

    assert_eq!(returned.assignment, before.assignment, "expected the returning node to regain its original roles");
    Ok(())
}

#[test]
fn expired_delay_window_triggers_replacement() -> Result<()> {
    let mut cluster = TestCluster::new(4, 8, 3);
    cluster.config.delay_rebalance_enabled = true;
    cluster.config.delay_rebalance_time_ms = DELAY_MS;
    let before = cluster.compute(None, 0)?;
    cluster.stop_node("node-0", 1_000);
    cluster.stop_node("node-1", 1_000);

    let during = cluster.compute(Some(&before.assignment), 2_000)?;
    let under_replicated = during.assignment.partitions.values().filter(|partition| partition.replicas.len() < 3).count();
    assert!(under_replicated > 0, "expected partitions to stay under replicated during the delay window");

    let after = cluster.compute(Some(&during.assignment), 1_000 + DELAY_MS + 1)?;
    assert_eq!(after.next_rebalance_at_ms, None, "expected no pending delay windows");
    for (name, partition) in after.assignment.partitions.iter() {
        assert_eq!(partition.replicas.len(), 2, "expected {} to use both remaining nodes, got {:?}", name, partition.replicas);
    }
    Ok(())
}

#[test]
fn min_active_replicas_are_kept_during_delay_window() -> Result<()> {
    let mut cluster = TestCluster::new(5, 5, 3);
    cluster.config.delay_rebalance_enabled = true;
    cluster.config.delay_rebalance_time_ms = DELAY_MS;
    cluster.ideal.min_active_replicas = 2;
    let before = cluster.compute(None, 0)?;
    let previous = before.assignment.partitions.get("db_0").context("missing partition")?.clone();
    cluster.stop_node(&previous.preference_list[0], 1_000);
    cluster.stop_node(&previous.preference_list[1], 1_000);

    let during = cluster.compute(Some(&before.assignment), 2_000)?;

    let partition = during.assignment.partitions.get("db_0").context("missing partition")?;
    assert_eq!(partition.replicas.len(), 2, "expected 2 live replicas, got {:?}", partition.replicas);
    assert_eq!(partition.preference_list.len(), 4, "expected the delayed nodes to keep their slots plus one extra");
    Ok(())
}

#[test]
fn disabled_nodes_are_excluded_immediately() -> Result<()> {
    let mut cluster = TestCluster::new(4, 4, 3);
    cluster.config.delay_rebalance_enabled = true;
    cluster.config.delay_rebalance_time_ms = DELAY_MS;
    let before = cluster.compute(None, 0)?;
    cluster.instances.get_mut("node-0").context("missing instance")?.enabled = false;

    let after = cluster.compute(Some(&before.assignment), 0)?;

    for (name, partition) in after.assignment.partitions.iter() {
        assert!(!partition.preference_list.iter().any(|node| node == "node-0"), "expected node-0 to be removed from {}", name);
        assert_eq!(partition.replicas.len(), 3, "expected {} to keep 3 replicas", name);
    }
    Ok(())
}

#[test]
fn semi_auto_follows_supplied_preference_lists() -> Result<()> {
    let mut cluster = TestCluster::new(4, 2, 3);
    cluster.ideal.rebalance_mode = RebalanceMode::SemiAuto;
    cluster
        .ideal
        .preference_lists
        .insert("db_0".into(), vec!["node-3".into(), "node-1".into(), "node-0".into()]);
    cluster
        .ideal
        .preference_lists
        .insert("db_1".into(), vec!["node-2".into(), "node-0".into(), "node-1".into()]);
    cluster.stop_node("node-2", 0);

    let output = cluster.compute(None, 0)?;

    assert_eq!(master_of(&output.assignment, "db_0").as_deref(), Some("node-3"), "expected the first listed node to be master");
    let db1 = output.assignment.state_map("db_1");
    assert_eq!(db1.len(), 2, "expected the stopped node to be skipped, got {:?}", db1);
    assert_eq!(db1.get("node-0").map(String::as_str), Some(STATE_MASTER), "expected node-0 to be promoted, got {:?}", db1);
    Ok(())
}

#[test]
fn customized_follows_supplied_map() -> Result<()> {
    let mut cluster = TestCluster::new(4, 2, 3);
    cluster.ideal.rebalance_mode = RebalanceMode::Customized;
    let map: BTreeMap<String, String> = (0..4)
        .map(|idx| (format!("node-{}", idx), if idx == 0 { STATE_MASTER } else { STATE_SLAVE }.to_string()))
        .collect();
    cluster.ideal.map_fields.insert("db_0".into(), map.clone());
    cluster.ideal.map_fields.insert("db_1".into(), map);
    cluster.stop_node("node-1", 0);
    cluster.current.entry("db_1".into()).or_default().insert("node-3".into(), STATE_ERROR.into());

    let output = cluster.compute(None, 0)?;

    let db0 = output.assignment.state_map("db_0");
    let expected: BTreeMap<String, String> = vec![("node-0", STATE_MASTER), ("node-2", STATE_SLAVE), ("node-3", STATE_SLAVE)]
        .into_iter()
        .map(|(node, state)| (node.to_string(), state.to_string()))
        .collect();
    assert_eq!(db0, expected, "unexpected customized placement");
    let db1 = output.assignment.state_map("db_1");
    assert_eq!(db1.get("node-3").map(String::as_str), Some(STATE_ERROR), "expected error replica to be kept as error");

    cluster.add_node("node-1");
    let output = cluster.compute(None, 0)?;
    assert_eq!(output.assignment.state_map("db_0").len(), 3, "expected the map to be truncated to the replica factor");
    Ok(())
}

#[test]
fn random_membership_changes_keep_placement_valid() -> Result<()> {
    let mut rng = rand::thread_rng();
    for _ in 0..25 {
        let nodes = rng.gen_range(3..10);
        let replicas = rng.gen_range(1..=3);
        let mut cluster = TestCluster::new(nodes, rng.gen_range(1..24), replicas);
        let mut previous = cluster.compute(None, 0)?;

        for _ in 0..5 {
            let node = format!("node-{}", rng.gen_range(0..nodes + 2));
            if cluster.live.contains(&node) && cluster.live.len() > 1 {
                cluster.stop_node(&node, 0);
            } else {
                cluster.add_node(&node);
            }
            let next = cluster.compute(Some(&previous.assignment), 0)?;
            let again = cluster.compute(Some(&previous.assignment), 0)?;
            assert_eq!(next, again, "expected identical inputs to yield identical assignments");

            let expected = (replicas as usize).min(cluster.live.len());
            for (name, partition) in next.assignment.partitions.iter() {
                let distinct: BTreeSet<&String> = partition.replicas.iter().map(|replica| &replica.node).collect();
                assert_eq!(distinct.len(), expected, "expected {} distinct replicas for {}, got {:?}", expected, name, partition.replicas);
                assert!(
                    distinct.iter().all(|node| cluster.live.contains(*node)),
                    "expected only live nodes in {}, got {:?}",
                    name,
                    partition.replicas
                );
                let masters = partition.replicas.iter().filter(|replica| replica.state == STATE_MASTER).count();
                assert_eq!(masters, 1, "expected exactly one master for {}, got {:?}", name, partition.replicas);
            }
            previous = next;
        }
    }
    Ok(())
}
