//! State model definitions.
//!
//! A state model is the finite state machine governing a single partition replica. It declares
//! the model's states in priority order, its legal transitions, and how many replicas of a
//! partition may be in each state.

mod table;

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::AppError;

pub use self::table::{StateModelFactory, TransitionFailure, TransitionFuture, TransitionHandler, TransitionTable, TransitionTableBuilder};

/// The name of the builtin master/slave state model.
pub const MASTER_SLAVE: &str = "MasterSlave";
/// The name of the builtin online/offline state model.
pub const ONLINE_OFFLINE: &str = "OnlineOffline";

pub const STATE_MASTER: &str = "MASTER";
pub const STATE_SLAVE: &str = "SLAVE";
pub const STATE_ONLINE: &str = "ONLINE";
pub const STATE_OFFLINE: &str = "OFFLINE";
pub const STATE_ERROR: &str = "ERROR";
pub const STATE_DROPPED: &str = "DROPPED";

/// State model definitions keyed by model name.
pub type StateModelDefinitions = BTreeMap<String, StateModelDefinition>;

/// The builtin state model definitions.
pub fn builtin_definitions() -> StateModelDefinitions {
    [StateModelDefinition::master_slave(), StateModelDefinition::online_offline()]
        .into_iter()
        .map(|def| (def.name().to_string(), def))
        .collect()
}

/// The upper bound on the number of replicas of a partition in a given state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateCount {
    /// At most this many replicas.
    Fixed(u32),
    /// At most the replica factor of the resource.
    Replicas,
}

impl StateCount {
    /// Resolve this bound against a replica factor.
    pub fn resolve(&self, replicas: u32) -> u32 {
        match self {
            Self::Fixed(val) => *val,
            Self::Replicas => replicas,
        }
    }
}

/// The definition of a state model.
#[derive(Clone, Debug)]
pub struct StateModelDefinition {
    /// The name of this model.
    name: String,
    /// All states of the model, in priority order. Index 0 is the top state.
    states: Vec<String>,
    /// The state of newly created instances.
    initial_state: String,
    /// The terminal state of instances whose transition failed.
    error_state: String,
    /// The terminal state of removed instances.
    dropped_state: String,
    /// Per state replica bounds. States without a bound are never assigned by placement.
    counts: BTreeMap<String, StateCount>,
    /// The legal transitions of the model.
    graph: DiGraph<String, ()>,
    /// State name to graph index.
    indices: HashMap<String, NodeIndex>,
}

impl StateModelDefinition {
    /// Start building a new state model definition.
    pub fn builder(name: impl Into<String>) -> StateModelDefinitionBuilder {
        StateModelDefinitionBuilder {
            name: name.into(),
            states: vec![],
            counts: BTreeMap::new(),
            initial_state: None,
            error_state: STATE_ERROR.into(),
            dropped_state: STATE_DROPPED.into(),
            edges: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All states in priority order.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// The highest priority state, e.g. `MASTER`.
    pub fn top_state(&self) -> &str {
        &self.states[0]
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn error_state(&self) -> &str {
        &self.error_state
    }

    pub fn dropped_state(&self) -> &str {
        &self.dropped_state
    }

    /// Check if the given state is declared by this model.
    pub fn has_state(&self, state: &str) -> bool {
        self.indices.contains_key(state)
    }

    /// The priority of the given state, lower is higher priority.
    pub fn priority(&self, state: &str) -> Option<usize> {
        self.states.iter().position(|val| val == state)
    }

    /// Check if `from -> to` is a legal transition of this model.
    pub fn is_edge(&self, from: &str, to: &str) -> bool {
        match (self.indices.get(from), self.indices.get(to)) {
            (Some(from), Some(to)) => self.graph.contains_edge(*from, *to),
            _ => false,
        }
    }

    /// All legal transitions of this model.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(from, to)| (self.graph[from].clone(), self.graph[to].clone()))
            .collect()
    }

    /// The replica bound of the given state, resolved against a replica factor.
    ///
    /// Returns `None` for states which placement never assigns.
    pub fn state_bound(&self, state: &str, replicas: u32) -> Option<u32> {
        self.counts.get(state).map(|count| count.resolve(replicas))
    }

    /// The states which placement assigns, in priority order, along with their resolved bounds.
    pub fn placement_states(&self, replicas: u32) -> Vec<(String, u32)> {
        self.states
            .iter()
            .filter_map(|state| self.state_bound(state, replicas).map(|bound| (state.clone(), bound)))
            .collect()
    }

    /// The first state on a shortest legal path from `from` to `to`.
    ///
    /// Returns `None` when no path exists or when `from == to`.
    pub fn next_hop(&self, from: &str, to: &str) -> Option<String> {
        let (start, goal) = (*self.indices.get(from)?, *self.indices.get(to)?);
        if start == goal {
            return None;
        }
        let (_, path) = petgraph::algo::astar(&self.graph, start, |node| node == goal, |_| 1u32, |_| 0)?;
        path.get(1).map(|idx| self.graph[*idx].clone())
    }

    /// The builtin master/slave model.
    ///
    /// At most one MASTER per partition, all other replicas SLAVE.
    pub fn master_slave() -> Self {
        let builder = Self::builder(MASTER_SLAVE)
            .state_with_count(STATE_MASTER, StateCount::Fixed(1))
            .state_with_count(STATE_SLAVE, StateCount::Replicas)
            .state(STATE_OFFLINE)
            .state(STATE_DROPPED)
            .state(STATE_ERROR)
            .initial_state(STATE_OFFLINE)
            .transition(STATE_OFFLINE, STATE_SLAVE)
            .transition(STATE_SLAVE, STATE_MASTER)
            .transition(STATE_MASTER, STATE_SLAVE)
            .transition(STATE_SLAVE, STATE_OFFLINE)
            .transition(STATE_OFFLINE, STATE_DROPPED)
            .transition(STATE_ERROR, STATE_DROPPED);
        builder.build_builtin()
    }

    /// The builtin online/offline model.
    pub fn online_offline() -> Self {
        let builder = Self::builder(ONLINE_OFFLINE)
            .state_with_count(STATE_ONLINE, StateCount::Replicas)
            .state(STATE_OFFLINE)
            .state(STATE_DROPPED)
            .state(STATE_ERROR)
            .initial_state(STATE_OFFLINE)
            .transition(STATE_OFFLINE, STATE_ONLINE)
            .transition(STATE_ONLINE, STATE_OFFLINE)
            .transition(STATE_OFFLINE, STATE_DROPPED)
            .transition(STATE_ERROR, STATE_DROPPED);
        builder.build_builtin()
    }
}

/// A builder of state model definitions.
pub struct StateModelDefinitionBuilder {
    name: String,
    states: Vec<String>,
    counts: BTreeMap<String, StateCount>,
    initial_state: Option<String>,
    error_state: String,
    dropped_state: String,
    edges: Vec<(String, String)>,
}

impl StateModelDefinitionBuilder {
    /// Declare the next state in priority order.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.states.push(state.into());
        self
    }

    /// Declare the next state in priority order, with a replica bound.
    pub fn state_with_count(mut self, state: impl Into<String>, count: StateCount) -> Self {
        let state = state.into();
        self.counts.insert(state.clone(), count);
        self.states.push(state);
        self
    }

    pub fn initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    /// Override the error state, `ERROR` by default.
    pub fn error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = state.into();
        self
    }

    /// Override the dropped state, `DROPPED` by default.
    pub fn dropped_state(mut self, state: impl Into<String>) -> Self {
        self.dropped_state = state.into();
        self
    }

    /// Declare a legal transition.
    pub fn transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Validate and build the definition.
    pub fn build(self) -> Result<StateModelDefinition> {
        let mut errors = vec![];
        let mut seen = HashSet::new();
        for state in self.states.iter() {
            if !seen.insert(state.as_str()) {
                errors.push(format!("duplicate state {}", state));
            }
        }
        if self.states.is_empty() {
            errors.push("no states declared".into());
        }
        let initial_state = self.initial_state.clone().unwrap_or_default();
        for (kind, state) in [("initial", &initial_state), ("error", &self.error_state), ("dropped", &self.dropped_state)] {
            if !seen.contains(state.as_str()) {
                errors.push(format!("{} state {:?} is not declared", kind, state));
            }
        }

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for state in self.states.iter() {
            if !indices.contains_key(state) {
                indices.insert(state.clone(), graph.add_node(state.clone()));
            }
        }
        let mut touched = HashSet::new();
        for (from, to) in self.edges.iter() {
            let (from_idx, to_idx) = match (indices.get(from), indices.get(to)) {
                (Some(from_idx), Some(to_idx)) => (*from_idx, *to_idx),
                _ => {
                    errors.push(format!("transition {} -> {} names an undeclared state", from, to));
                    continue;
                }
            };
            if graph.contains_edge(from_idx, to_idx) {
                errors.push(format!("duplicate transition {} -> {}", from, to));
                continue;
            }
            graph.add_edge(from_idx, to_idx, ());
            touched.insert(from.as_str());
            touched.insert(to.as_str());
        }
        for state in self.states.iter() {
            if !touched.contains(state.as_str()) {
                errors.push(format!("state {} is not part of any transition", state));
            }
        }

        if !errors.is_empty() {
            return Err(AppError::InvalidArgument(format!("invalid state model {}: {}", self.name, errors.join("; "))).into());
        }
        Ok(StateModelDefinition {
            name: self.name,
            states: self.states,
            initial_state,
            error_state: self.error_state,
            dropped_state: self.dropped_state,
            counts: self.counts,
            graph,
            indices,
        })
    }

    /// Build one of the builtin definitions, which are statically known to be valid.
    fn build_builtin(self) -> StateModelDefinition {
        match self.build() {
            Ok(def) => def,
            Err(err) => unreachable!("builtin state model is invalid: {:?}", err),
        }
    }
}
