//! The leader gated rebalance loop.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::coordination::LeaderState;
use corral_core::controller::Controller;
use corral_core::paths::PathBuilder;
use corral_core::store::StoreRef;
use corral_core::utils;

/// A task running rebalance passes while this controller holds the leader lease.
///
/// A pass is triggered by any change under the cluster's root path, by the expiry of a delay
/// window reported by the previous pass, and at least once per interval.
pub struct RebalanceLoop {
    controller: Controller,
    store: StoreRef,
    paths: PathBuilder,
    interval: Duration,
    leader: watch::Receiver<LeaderState>,
    shutdown: broadcast::Receiver<()>,

    /// The time at which a delay window reported by the last pass expires.
    next_rebalance_at_ms: Option<u64>,
}

impl RebalanceLoop {
    pub fn new(
        controller: Controller, store: StoreRef, paths: PathBuilder, interval: Duration, leader: watch::Receiver<LeaderState>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            controller,
            store,
            paths,
            interval,
            leader,
            shutdown,
            next_rebalance_at_ms: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(cluster = self.paths.cluster(), "rebalance loop started");
        let prefix = format!("{}/", self.paths.root());
        let lease_path = self.paths.controller_leader();
        let mut events = self.store.watch();
        let mut pending = false;

        loop {
            let triggered = if pending {
                true
            } else {
                let delay = tokio::time::sleep(self.next_delay());
                tokio::pin!(delay);
                tokio::select! {
                    _ = &mut delay => true,
                    event = events.recv() => match event {
                        Ok(event) => event.path().starts_with(&prefix) && event.path() != lease_path,
                        Err(RecvError::Lagged(_)) => true,
                        Err(RecvError::Closed) => break,
                    },
                    res = self.leader.changed() => match res {
                        Ok(_) => true,
                        Err(_) => break,
                    },
                    _ = self.shutdown.recv() => break,
                }
            };
            if !triggered || !matches!(*self.leader.borrow(), LeaderState::Leading) {
                pending = false;
                continue;
            }
            pending = self.rebalance().await;

            // Changes made during the pass collapse into a single follow up pass.
            loop {
                match events.try_recv() {
                    Ok(event) => pending |= event.path().starts_with(&prefix) && event.path() != lease_path,
                    Err(TryRecvError::Lagged(_)) => pending = true,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }

        tracing::info!(cluster = self.paths.cluster(), "rebalance loop stopped");
        Ok(())
    }

    /// Run one rebalance pass, returning true when messages were sent and a follow up pass is
    /// needed.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn rebalance(&mut self) -> bool {
        match self.controller.rebalance().await {
            Ok(report) => {
                self.next_rebalance_at_ms = report.next_rebalance_at_ms;
                if report.skipped_for_maintenance {
                    return false;
                }
                tracing::debug!(
                    completed = report.completed,
                    errors = report.errors,
                    retries = report.retries,
                    send_failures = report.send_failures,
                    frozen = ?report.frozen_partitions,
                    "rebalance pass finished"
                );
                report.messages_sent() > 0
            }
            Err(err) => {
                tracing::error!(error = ?err, "error during rebalance pass");
                false
            }
        }
    }

    /// The delay until the next pass, bounded by the interval and any pending delay window.
    fn next_delay(&self) -> Duration {
        match self.next_rebalance_at_ms {
            Some(at) => {
                let until = Duration::from_millis(at.saturating_sub(utils::now_ms()));
                until.min(self.interval)
            }
            None => self.interval,
        }
    }
}
