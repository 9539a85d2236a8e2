//! The controller rebalance pipeline.
//!
//! One pass loads a snapshot of the cluster, computes the best possible assignment of every
//! resource, and sends each misplaced replica one hop along its state model graph towards its
//! assigned state. Passes are repeated until the cluster converges.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future;

use crate::engine::{Ack, TransitionMessage};
use crate::models::{ExternalView, IdealState, ResourceAssignment};
use crate::paths::PathBuilder;
use crate::snapshot::ClusterSnapshot;
use crate::statemodel::{StateModelDefinition, StateModelDefinitions};
use crate::store::{self, Expected, NodeMode, StoreRef};

pub const METRIC_MESSAGES_SENT: &str = "corral_messages_sent";

/// The transport delivering transition messages to nodes.
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// Deliver a message to its target node, returning the node's acknowledgement.
    async fn send(&self, message: TransitionMessage) -> Result<Ack>;
}

/// The outcome of a single rebalance pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RebalanceReport {
    /// The pass was skipped because the cluster is in maintenance mode.
    pub skipped_for_maintenance: bool,
    /// The computed assignment of each resource.
    pub assignments: BTreeMap<String, ResourceAssignment>,
    /// Partitions held at their previous assignment, keyed by resource.
    pub frozen_partitions: BTreeMap<String, Vec<String>>,
    /// Messages acknowledged as completed.
    pub completed: usize,
    /// Messages whose transition failed.
    pub errors: usize,
    /// Messages whose transition was rolled back.
    pub retries: usize,
    /// Messages which could not be delivered.
    pub send_failures: usize,
    /// The earliest time at which a delay window expires and a new pass is needed.
    pub next_rebalance_at_ms: Option<u64>,
}

impl RebalanceReport {
    /// The total number of messages sent during the pass.
    pub fn messages_sent(&self) -> usize {
        self.completed + self.errors + self.retries + self.send_failures
    }
}

/// The controller of a single cluster.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    /// The name of this controller, sent as the session of its messages.
    name: String,
    store: StoreRef,
    paths: PathBuilder,
    definitions: StateModelDefinitions,
    transport: Arc<dyn MessageTransport>,
    /// The last assignment computed for each resource.
    previous: DashMap<String, ResourceAssignment>,
}

impl Controller {
    pub fn new(
        name: impl Into<String>, store: StoreRef, paths: PathBuilder, definitions: StateModelDefinitions, transport: Arc<dyn MessageTransport>,
    ) -> Self {
        metrics::register_counter!(METRIC_MESSAGES_SENT, metrics::Unit::Count, "transition messages sent to nodes");
        Self {
            inner: Arc::new(ControllerInner {
                name: name.into(),
                store,
                paths,
                definitions,
                transport,
                previous: DashMap::new(),
            }),
        }
    }

    /// The state model definitions known to this controller.
    pub fn definitions(&self) -> &StateModelDefinitions {
        &self.inner.definitions
    }

    /// Run one rebalance pass.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = self.inner.paths.cluster()))]
    pub async fn rebalance(&self) -> Result<RebalanceReport> {
        let snapshot = ClusterSnapshot::load(self.inner.store.as_ref(), &self.inner.paths).await?;
        let mut report = RebalanceReport::default();
        if let Some(signal) = snapshot.maintenance.as_ref() {
            tracing::debug!(reason = %signal.reason, "cluster is in maintenance mode, skipping rebalance");
            report.skipped_for_maintenance = true;
            return Ok(report);
        }

        let live_nodes = snapshot.live_nodes();
        let (mut downward, mut upward) = (vec![], vec![]);
        for (resource, ideal_state) in snapshot.ideal_states.iter() {
            self.publish_external_view(&snapshot.external_view(resource)).await;

            let previous = self.inner.previous.get(resource).map(|entry| entry.value().clone());
            let output = match snapshot.compute_best_possible(resource, &self.inner.definitions, previous.as_ref()) {
                Some(output) => output,
                None => continue,
            };
            let definition = match self.inner.definitions.get(&ideal_state.state_model_def_ref) {
                Some(definition) => definition,
                None => continue,
            };
            if snapshot.cluster.persist_best_possible_assignment && snapshot.best_possible.get(resource) != Some(&output.assignment) {
                let path = self.inner.paths.best_possible(resource);
                if let Err(err) = store::write_model(self.inner.store.as_ref(), &path, &output.assignment, Expected::Any, NodeMode::Persistent).await {
                    tracing::error!(error = ?err, resource = %resource, "error persisting best possible assignment");
                }
            }

            let observed = snapshot.resource_states(resource);
            for mut message in generate_messages(ideal_state, definition, &output.assignment, &observed, &live_nodes) {
                message.session_id = self.inner.name.clone();
                let down = match (definition.priority(&message.from_state), definition.priority(&message.to_state)) {
                    (Some(from), Some(to)) => to > from,
                    _ => true,
                };
                if down {
                    downward.push(message);
                } else {
                    upward.push(message);
                }
            }

            if !output.frozen_partitions.is_empty() {
                report.frozen_partitions.insert(resource.clone(), output.frozen_partitions.clone());
            }
            report.next_rebalance_at_ms = match (report.next_rebalance_at_ms, output.next_rebalance_at_ms) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            self.inner.previous.insert(resource.clone(), output.assignment.clone());
            report.assignments.insert(resource.clone(), output.assignment);
        }

        // Demotions complete before any promotion is sent.
        self.send_all(downward, &mut report).await;
        self.send_all(upward, &mut report).await;
        Ok(report)
    }

    async fn send_all(&self, messages: Vec<TransitionMessage>, report: &mut RebalanceReport) {
        let transport = self.inner.transport.clone();
        let sends = messages.into_iter().map(|message| {
            let transport = transport.clone();
            async move {
                let res = transport.send(message.clone()).await;
                (message, res)
            }
        });
        for (message, res) in future::join_all(sends).await {
            metrics::increment_counter!(METRIC_MESSAGES_SENT);
            match res {
                Ok(ack) => {
                    if ack != Ack::Completed {
                        tracing::warn!(
                            resource = %message.resource,
                            partition = %message.partition,
                            node = %message.target_node,
                            from = %message.from_state,
                            to = %message.to_state,
                            ?ack,
                            "transition was not completed"
                        );
                    }
                    match ack {
                        Ack::Completed => report.completed += 1,
                        Ack::Error => report.errors += 1,
                        Ack::Retry => report.retries += 1,
                    }
                }
                Err(err) => {
                    tracing::error!(error = ?err, node = %message.target_node, "error delivering transition message");
                    report.send_failures += 1;
                }
            }
        }
    }

    async fn publish_external_view(&self, view: &ExternalView) {
        let path = self.inner.paths.external_view(&view.resource_name);
        let res = async {
            if let Some((current, _)) = store::read_model::<ExternalView>(self.inner.store.as_ref(), &path).await? {
                if &current == view {
                    return Ok(());
                }
            }
            store::write_model(self.inner.store.as_ref(), &path, view, Expected::Any, NodeMode::Persistent).await.map(|_| ())
        }
        .await;
        if let Err(err) = res {
            tracing::error!(error = ?err, resource = %view.resource_name, "error publishing external view");
        }
    }
}

/// Generate the messages moving each live replica one hop towards its assigned state.
///
/// Replicas no longer assigned to a node are moved towards the dropped state. A hop into a
/// state whose replica bound is already filled by other replicas is deferred to a later pass,
/// so a new top state is only promoted once the old one has been demoted.
pub fn generate_messages(
    ideal_state: &IdealState, definition: &StateModelDefinition, assignment: &ResourceAssignment, observed: &BTreeMap<String, BTreeMap<String, String>>,
    live_nodes: &BTreeSet<String>,
) -> Vec<TransitionMessage> {
    let mut messages = vec![];
    let empty = BTreeMap::new();
    for partition in ideal_state.partition_names() {
        let target = assignment.state_map(&partition);
        let current: BTreeMap<&String, &String> = observed
            .get(&partition)
            .unwrap_or(&empty)
            .iter()
            .filter(|(_, state)| state.as_str() != definition.dropped_state())
            .collect();

        let nodes: BTreeSet<&String> = target.keys().chain(current.keys().copied()).filter(|node| live_nodes.contains(*node)).collect();
        for node in nodes {
            let from = current.get(node).map(|state| state.as_str()).unwrap_or_else(|| definition.initial_state());
            let to = target.get(node).map(String::as_str).unwrap_or_else(|| definition.dropped_state());
            if from == to {
                continue;
            }
            let hop = match definition.next_hop(from, to) {
                Some(hop) => hop,
                None => {
                    tracing::warn!(resource = %ideal_state.resource_name, partition = %partition, node = %node, from, to, "no transition path between states");
                    continue;
                }
            };
            if let Some(bound) = definition.state_bound(&hop, ideal_state.replicas) {
                let holders = current.iter().filter(|(other, state)| **other != node && state.as_str() == hop).count();
                if holders as u32 >= bound {
                    tracing::debug!(resource = %ideal_state.resource_name, partition = %partition, node = %node, state = %hop, "deferring transition until the state is released");
                    continue;
                }
            }
            messages.push(TransitionMessage::new(
                ideal_state.resource_name.clone(),
                partition.clone(),
                from,
                hop,
                node.clone(),
                ideal_state.state_model_def_ref.clone(),
            ));
        }
    }
    messages
}
