//! Periodic assignment and convergence reporting.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use corral_core::paths::PathBuilder;
use corral_core::snapshot::ClusterSnapshot;
use corral_core::store::StoreRef;
use corral_core::verifier::ClusterVerifier;

/// A task logging the external view of every resource and the convergence of the cluster.
///
/// Errors end the task and are returned through its join handle.
pub struct Reporter {
    store: StoreRef,
    paths: PathBuilder,
    verifier: ClusterVerifier,
    report_interval: Duration,
    verify_interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Reporter {
    pub fn new(
        store: StoreRef, paths: PathBuilder, verifier: ClusterVerifier, report_interval: Duration, verify_interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            paths,
            verifier,
            report_interval,
            verify_interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("reporter task started");
        let mut report_ticker = tokio::time::interval(self.report_interval);
        let mut verify_ticker = tokio::time::interval(self.verify_interval);
        loop {
            tokio::select! {
                _ = report_ticker.tick() => self.report_assignments().await.context("error reporting assignments")?,
                _ = verify_ticker.tick() => self.report_convergence().await.context("error verifying cluster convergence")?,
                _ = self.shutdown.recv() => break,
            }
        }
        tracing::debug!("reporter task stopped");
        Ok(())
    }

    async fn report_assignments(&self) -> Result<()> {
        let snapshot = ClusterSnapshot::load(self.store.as_ref(), &self.paths).await?;
        for resource in snapshot.ideal_states.keys() {
            for (partition, states) in snapshot.external_view(resource).partitions.iter() {
                tracing::info!(resource = %resource, partition = %partition, ?states, "partition assignment");
            }
        }
        Ok(())
    }

    async fn report_convergence(&self) -> Result<()> {
        let diverged = self.verifier.divergences(&[]).await?;
        if diverged.is_empty() {
            tracing::info!(cluster = self.paths.cluster(), "cluster has converged");
        } else {
            for divergence in diverged.iter() {
                tracing::info!(
                    resource = %divergence.resource,
                    partition = %divergence.partition,
                    expected = ?divergence.expected,
                    observed = ?divergence.observed,
                    "partition has not converged"
                );
            }
        }
        let converged = if diverged.is_empty() { 1.0 } else { 0.0 };
        metrics::gauge!(corral_core::verifier::METRIC_CLUSTER_CONVERGED, converged);
        Ok(())
    }
}
