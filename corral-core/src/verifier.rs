//! Cluster convergence verification.
//!
//! A cluster has converged when the externally observed placement of every targeted resource
//! equals its best possible placement, computed fresh from the current cluster state.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::error::AppError;
use crate::paths::PathBuilder;
use crate::snapshot::ClusterSnapshot;
use crate::statemodel::{StateModelDefinitions, STATE_DROPPED};
use crate::store::StoreRef;

pub const METRIC_CLUSTER_CONVERGED: &str = "corral_cluster_converged";

/// The default interval between checks of a polling verifier.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The verification strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verifier {
    /// Check once and return immediately.
    OneShot,
    /// Check on every store change under the cluster and on every interval tick, until
    /// convergence or timeout.
    Polling { interval: Duration },
}

impl Default for Verifier {
    fn default() -> Self {
        Self::Polling {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A partition whose observed placement differs from its best possible placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Divergence {
    pub resource: String,
    pub partition: String,
    /// Node to state, as computed.
    pub expected: BTreeMap<String, String>,
    /// Node to state, as observed.
    pub observed: BTreeMap<String, String>,
}

/// Verifies the convergence of a cluster.
#[derive(Clone)]
pub struct ClusterVerifier {
    store: StoreRef,
    paths: PathBuilder,
    definitions: StateModelDefinitions,
    strategy: Verifier,
}

impl ClusterVerifier {
    pub fn new(store: StoreRef, paths: PathBuilder, definitions: StateModelDefinitions, strategy: Verifier) -> Self {
        metrics::register_gauge!(METRIC_CLUSTER_CONVERGED, metrics::Unit::Count, "1 when the cluster has converged, else 0");
        Self {
            store,
            paths,
            definitions,
            strategy,
        }
    }

    /// Verify that the given resources have converged, all resources when empty.
    ///
    /// A polling verifier fails with `AppError::ConvergenceTimeout` once `timeout` elapses.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn verify(&self, resources: &[String], timeout: Duration) -> Result<bool> {
        let interval = match self.strategy {
            Verifier::OneShot => return self.check(resources).await,
            Verifier::Polling { interval } => interval,
        };

        // Subscribe first so that no change between a check and the wait is missed.
        let mut events = self.store.watch();
        let prefix = format!("{}/", self.paths.root());
        let deadline = tokio::time::sleep_until(Instant::now() + timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut events_open = true;
        loop {
            if self.check(resources).await? {
                return Ok(true);
            }
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        tracing::warn!(cluster = self.paths.cluster(), ?resources, "cluster did not converge in time");
                        return Err(AppError::ConvergenceTimeout { waited_ms: timeout.as_millis() as u64 }.into());
                    }
                    _ = ticker.tick() => break,
                    event = events.recv(), if events_open => match event {
                        Ok(event) if event.path().starts_with(&prefix) => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => events_open = false,
                    },
                }
            }
        }
    }

    /// Like `verify`, mapping a timeout to `false`.
    pub async fn verify_converged(&self, resources: &[String], wait_ms: u64) -> Result<bool> {
        match self.verify(resources, Duration::from_millis(wait_ms)).await {
            Ok(converged) => Ok(converged),
            Err(err) => match err.downcast_ref::<AppError>() {
                Some(AppError::ConvergenceTimeout { .. }) => Ok(false),
                _ => Err(err),
            },
        }
    }

    /// The partitions of the given resources which have not converged.
    pub async fn divergences(&self, resources: &[String]) -> Result<Vec<Divergence>> {
        let snapshot = ClusterSnapshot::load(self.store.as_ref(), &self.paths).await?;
        Ok(divergences(&snapshot, &self.definitions, resources))
    }

    async fn check(&self, resources: &[String]) -> Result<bool> {
        let diverged = self.divergences(resources).await?;
        let converged = diverged.is_empty();
        let gauge = if converged { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_CLUSTER_CONVERGED, gauge);
        if !converged {
            tracing::debug!(cluster = self.paths.cluster(), count = diverged.len(), first = ?diverged.first(), "cluster has not converged");
        }
        Ok(converged)
    }
}

/// Compare the observed placement of each resource against its best possible placement.
///
/// An empty resource list targets every resource of the snapshot. Replicas observed in the
/// dropped state are ignored. A resource whose best possible placement cannot be computed is
/// reported as diverged in full.
pub fn divergences(snapshot: &ClusterSnapshot, definitions: &StateModelDefinitions, resources: &[String]) -> Vec<Divergence> {
    let targets: Vec<String> = if resources.is_empty() {
        snapshot.ideal_states.keys().cloned().collect()
    } else {
        resources.to_vec()
    };

    let mut diverged = vec![];
    for resource in targets.iter() {
        let observed = snapshot.resource_states(resource);
        let expected = match snapshot.compute_best_possible(resource, definitions, None) {
            Some(output) => output.assignment,
            None => {
                diverged.push(Divergence {
                    resource: resource.clone(),
                    partition: String::new(),
                    expected: BTreeMap::new(),
                    observed: BTreeMap::new(),
                });
                continue;
            }
        };

        let mut partitions: Vec<&String> = expected.partitions.keys().chain(observed.keys()).collect();
        partitions.sort();
        partitions.dedup();
        for partition in partitions {
            let expected_states = expected.state_map(partition);
            let observed_states: BTreeMap<String, String> = observed
                .get(partition)
                .map(|states| states.iter().filter(|(_, state)| *state != STATE_DROPPED).map(|(node, state)| (node.clone(), state.clone())).collect())
                .unwrap_or_default();
            if expected_states != observed_states {
                diverged.push(Divergence {
                    resource: resource.clone(),
                    partition: partition.clone(),
                    expected: expected_states,
                    observed: observed_states,
                });
            }
        }
    }
    diverged
}
