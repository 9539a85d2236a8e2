//! Point in time views of a cluster.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::error::AppError;
use crate::models::{
    ClusterConfig, CurrentState, ExternalView, IdealState, InstanceConfig, InstanceHistory, LiveInstance, MaintenanceSignal, PartitionAssignment,
    Replica, ResourceAssignment,
};
use crate::paths::PathBuilder;
use crate::placement::{self, PlacementInput, PlacementOutput};
use crate::statemodel::{StateModelDefinition, StateModelDefinitions};
use crate::store::{self, CoordinationStore};
use crate::topology::ClusterTopology;
use crate::utils;

/// An immutable view of every record of a cluster, loaded from the store in one pass.
#[derive(Clone, Debug)]
pub struct ClusterSnapshot {
    pub cluster: ClusterConfig,
    pub instances: BTreeMap<String, InstanceConfig>,
    pub live_instances: BTreeMap<String, LiveInstance>,
    /// The last time each non-live node went offline.
    pub offline_since: BTreeMap<String, u64>,
    pub ideal_states: BTreeMap<String, IdealState>,
    /// Node to resource to current state, only for live nodes and their current session.
    pub current_states: BTreeMap<String, BTreeMap<String, CurrentState>>,
    /// Node to resource to the last current state published by each node which is not live.
    pub last_known_states: BTreeMap<String, BTreeMap<String, CurrentState>>,
    /// Persisted best possible assignments, keyed by resource.
    pub best_possible: BTreeMap<String, ResourceAssignment>,
    pub maintenance: Option<MaintenanceSignal>,
    pub topology: ClusterTopology,
    /// The time at which this snapshot was loaded, in epoch millis.
    pub now_ms: u64,
}

impl ClusterSnapshot {
    /// Load a snapshot of the given cluster.
    #[tracing::instrument(level = "debug", skip(store, paths), fields(cluster = paths.cluster()))]
    pub async fn load(store: &dyn CoordinationStore, paths: &PathBuilder) -> Result<Self> {
        let cluster = match store::read_model::<ClusterConfig>(store, &paths.cluster_config()).await? {
            Some((cluster, _)) => cluster,
            None => return Err(AppError::Precondition(format!("cluster {} has no cluster config", paths.cluster())).into()),
        };
        let instances = store::read_children_models::<InstanceConfig>(store, &paths.instance_configs())
            .await
            .context("error loading instance configs")?;
        let live_instances = store::read_children_models::<LiveInstance>(store, &paths.live_instances())
            .await
            .context("error loading live instances")?;

        let mut offline_since = BTreeMap::new();
        for node in instances.keys().filter(|node| !live_instances.contains_key(*node)) {
            if let Some((history, _)) = store::read_model::<InstanceHistory>(store, &paths.instance_history(node)).await? {
                if let Some(ts) = history.last_offline_ms {
                    offline_since.insert(node.clone(), ts);
                }
            }
        }

        let mut current_states = BTreeMap::new();
        for (node, live) in live_instances.iter() {
            let states = store::read_children_models::<CurrentState>(store, &paths.current_states(node))
                .await
                .with_context(|| format!("error loading current states of {}", node))?;
            let states: BTreeMap<String, CurrentState> = states.into_iter().filter(|(_, state)| state.session_id == live.session_id).collect();
            current_states.insert(node.clone(), states);
        }

        let mut last_known_states = BTreeMap::new();
        for node in instances.keys().filter(|node| !live_instances.contains_key(*node)) {
            let states = store::read_children_models::<CurrentState>(store, &paths.current_states(node))
                .await
                .with_context(|| format!("error loading last known states of {}", node))?;
            if !states.is_empty() {
                last_known_states.insert(node.clone(), states);
            }
        }

        let ideal_states = store::read_children_models::<IdealState>(store, &paths.ideal_states())
            .await
            .context("error loading ideal states")?;
        let mut best_possible = BTreeMap::new();
        for resource in ideal_states.keys() {
            if let Some((assignment, _)) = store::read_model::<ResourceAssignment>(store, &paths.best_possible(resource)).await? {
                best_possible.insert(resource.clone(), assignment);
            }
        }
        let maintenance = store::read_model::<MaintenanceSignal>(store, &paths.maintenance()).await?.map(|(signal, _)| signal);
        let topology = ClusterTopology::from_cluster(&cluster, &instances)?;

        Ok(Self {
            cluster,
            instances,
            live_instances,
            offline_since,
            ideal_states,
            current_states,
            last_known_states,
            best_possible,
            maintenance,
            topology,
            now_ms: utils::now_ms(),
        })
    }

    /// The names of all live nodes.
    pub fn live_nodes(&self) -> BTreeSet<String> {
        self.live_instances.keys().cloned().collect()
    }

    /// The observed states of a resource's replicas, partition to node to state.
    pub fn resource_states(&self, resource: &str) -> BTreeMap<String, BTreeMap<String, String>> {
        self.external_view(resource).partitions
    }

    /// The external view of a resource, aggregated from the current states of live nodes.
    pub fn external_view(&self, resource: &str) -> ExternalView {
        let states = self
            .current_states
            .iter()
            .filter_map(|(node, resources)| resources.get(resource).map(|state| (node, state)));
        ExternalView::aggregate(resource, states)
    }

    /// The assignment a resource currently holds, rebuilt from observed states.
    ///
    /// Live nodes contribute their current states and nodes which are not live their last known
    /// states, so replicas of offline nodes keep their slot while within the delay window.
    /// Each preference list is ordered by state priority, then node. Dropped replicas are ignored.
    pub fn observed_assignment(&self, resource: &str, definition: &StateModelDefinition) -> ResourceAssignment {
        let states = self
            .current_states
            .iter()
            .chain(self.last_known_states.iter())
            .filter_map(|(node, resources)| resources.get(resource).map(|state| (node, state)));
        let view = ExternalView::aggregate(resource, states);

        let mut assignment = ResourceAssignment::new(resource);
        for (partition, states) in view.partitions {
            let mut replicas: Vec<Replica> = states
                .into_iter()
                .filter(|(_, state)| state.as_str() != definition.dropped_state())
                .map(|(node, state)| Replica::new(node, state))
                .collect();
            if replicas.is_empty() {
                continue;
            }
            replicas.sort_by_key(|replica| (definition.priority(&replica.state).unwrap_or(usize::MAX), replica.node.clone()));
            let preference_list = replicas.iter().map(|replica| replica.node.clone()).collect();
            assignment.partitions.insert(partition, PartitionAssignment { preference_list, replicas });
        }
        assignment
    }

    /// Compute the best possible assignment of a resource.
    ///
    /// The previous assignment is `previous` when given, else the persisted best possible
    /// assignment of the resource, else the assignment rebuilt from observed states. Returns
    /// `None` when the resource or its state model is unknown.
    pub fn compute_best_possible(
        &self, resource: &str, definitions: &StateModelDefinitions, previous: Option<&ResourceAssignment>,
    ) -> Option<PlacementOutput> {
        let ideal_state = self.ideal_states.get(resource)?;
        let definition = match definitions.get(&ideal_state.state_model_def_ref) {
            Some(definition) => definition,
            None => {
                tracing::warn!(resource, state_model = %ideal_state.state_model_def_ref, "no definition known for state model of resource");
                return None;
            }
        };
        let live_nodes = self.live_nodes();
        let current_states = self.resource_states(resource);
        let observed;
        let previous = match previous.or_else(|| self.best_possible.get(resource)) {
            Some(previous) => Some(previous),
            None => {
                observed = self.observed_assignment(resource, definition);
                Some(&observed).filter(|observed| !observed.partitions.is_empty())
            }
        };
        let input = PlacementInput {
            ideal_state,
            definition,
            cluster: &self.cluster,
            topology: &self.topology,
            instances: &self.instances,
            live_nodes: &live_nodes,
            offline_since: &self.offline_since,
            current_states: &current_states,
            previous,
            now_ms: self.now_ms,
        };
        Some(placement::compute_best_possible(&input))
    }
}
