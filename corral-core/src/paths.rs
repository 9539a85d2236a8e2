//! Canonical coordination store paths of a cluster.

/// Builds the store paths of a single cluster.
#[derive(Clone, Debug)]
pub struct PathBuilder {
    cluster: String,
}

impl PathBuilder {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self { cluster: cluster.into() }
    }

    /// The name of the cluster.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The root of all paths of this cluster.
    pub fn root(&self) -> String {
        format!("/{}", self.cluster)
    }

    pub fn cluster_config(&self) -> String {
        format!("/{}/CONFIGS/CLUSTER/{}", self.cluster, self.cluster)
    }

    pub fn instance_configs(&self) -> String {
        format!("/{}/CONFIGS/PARTICIPANT", self.cluster)
    }

    pub fn instance_config(&self, node: &str) -> String {
        format!("/{}/CONFIGS/PARTICIPANT/{}", self.cluster, node)
    }

    pub fn live_instances(&self) -> String {
        format!("/{}/LIVEINSTANCES", self.cluster)
    }

    pub fn live_instance(&self, node: &str) -> String {
        format!("/{}/LIVEINSTANCES/{}", self.cluster, node)
    }

    pub fn instance_history(&self, node: &str) -> String {
        format!("/{}/INSTANCES/{}/HISTORY", self.cluster, node)
    }

    pub fn ideal_states(&self) -> String {
        format!("/{}/IDEALSTATES", self.cluster)
    }

    pub fn ideal_state(&self, resource: &str) -> String {
        format!("/{}/IDEALSTATES/{}", self.cluster, resource)
    }

    pub fn current_states(&self, node: &str) -> String {
        format!("/{}/CURRENTSTATES/{}", self.cluster, node)
    }

    pub fn current_state(&self, node: &str, resource: &str) -> String {
        format!("/{}/CURRENTSTATES/{}/{}", self.cluster, node, resource)
    }

    pub fn external_view(&self, resource: &str) -> String {
        format!("/{}/EXTERNALVIEW/{}", self.cluster, resource)
    }

    pub fn best_possible(&self, resource: &str) -> String {
        format!("/{}/BESTPOSSIBLE/{}", self.cluster, resource)
    }

    pub fn maintenance(&self) -> String {
        format!("/{}/CONTROLLER/MAINTENANCE", self.cluster)
    }

    pub fn controller_leader(&self) -> String {
        format!("/{}/CONTROLLER/LEADER", self.cluster)
    }
}
