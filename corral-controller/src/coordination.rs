//! Controller leadership built around a lease node in the coordination store.
//!
//! The lease is an ephemeral node at `/{cluster}/CONTROLLER/LEADER` owned by the session of the
//! current holder. The holder renews it on an interval. Other candidates take it over once no
//! renewal has been observed for a full lease duration. Before acting as leader, tasks consult
//! the state published on the elector's watch channel.

use anyhow::{ensure, Context, Result};
use chrono::{prelude::*, Duration};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use corral_core::paths::PathBuilder;
use corral_core::store::{self, Expected, NodeMode, StoreRef};
use corral_core::StoreError;

type DateTimeUtc = DateTime<Utc>;

const METRIC_IS_LEADER: &str = "corral_controller_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "corral_controller_num_leadership_changes";

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This controller is the leader.
    Leading,
    /// A different controller is currently the leader, identified by the encapsulated string.
    Following(String),
    /// The lease state is unknown, or the elector is starting or stopping.
    Standby,
}

/// The lease record stored at the leader path.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerLease {
    pub holder_identity: String,
    pub acquire_time: DateTimeUtc,
    pub renew_time: DateTimeUtc,
    pub lease_duration_seconds: i64,
    pub lease_transitions: u32,
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// The identity to use when the lease is acquired.
    identity: String,
    /// The duration that non-leader candidates will wait to force acquire leadership, measured
    /// against the time of the last observed lease change.
    lease_duration: Duration,
    /// The duration that the current lease holder waits between renewals.
    renew_deadline: Duration,
}

impl LeaderElectionConfig {
    /// Create a new `LeaderElectionConfig` instance, validating given inputs.
    pub fn new(identity: impl Into<String>, lease_duration: Duration, renew_deadline: Duration) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease_duration must be greater than renew_deadline");
        ensure!(renew_deadline.num_seconds() >= 1, "renew_deadline must be at least 1 second");
        Ok(Self {
            identity: identity.into(),
            lease_duration,
            renew_deadline,
        })
    }
}

/// A task which is responsible for acquiring and maintaining the controller lease.
pub struct LeaderElector {
    store: StoreRef,
    paths: PathBuilder,
    config: LeaderElectionConfig,
    /// The session owning the lease node while this elector holds it.
    session: String,
    /// Sender for the current state of the leadership coordination system.
    state_tx: watch::Sender<LeaderState>,
    /// The last known leader state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: broadcast::Receiver<()>,

    /// The last observed lease, along with its version.
    last_observed_lease: Option<(ControllerLease, i64)>,
    /// The last time when a change was observed on the lease.
    last_observed_change: DateTimeUtc,
}

impl LeaderElector {
    /// Create a new `LeaderElector` instance.
    pub fn new(
        store: StoreRef, paths: PathBuilder, config: LeaderElectionConfig, shutdown: broadcast::Receiver<()>,
    ) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes of the controller lease");
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this controller is the leader, where 1.0 indicates leadership, any other value does not"
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let session = format!("{}-{}", config.identity, Uuid::new_v4());
        (
            Self {
                store,
                paths,
                config,
                session,
                state_tx,
                state: LeaderState::Standby,
                shutdown,
                last_observed_lease: None,
                last_observed_change: Utc::now(),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!("leader elector task started");
        let lease_path = self.paths.controller_leader();
        let mut events = self.store.watch();

        if let Err(err) = self.try_acquire_or_renew().await {
            tracing::error!(error = ?err, "error attempting to acquire/renew lease");
        }

        loop {
            let delay_duration = self.get_next_acquire_renew_time();
            tracing::debug!("delaying for {}ms", delay_duration.as_millis());
            let delay = tokio::time::sleep(delay_duration);
            tokio::pin!(delay);
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) if event.path() == lease_path => self.handle_lease_change().await,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => self.handle_lease_change().await,
                    Err(RecvError::Closed) => break,
                },
                _ = &mut delay => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
                        if !matches!(&self.state, LeaderState::Standby) {
                            self.set_state(LeaderState::Standby);
                        }
                        self.last_observed_change = Utc::now();
                    }
                }
                _ = self.shutdown.recv() => break,
            }
        }

        if matches!(self.state, LeaderState::Leading) {
            if let Err(err) = self.store.close_session(&self.session).await {
                tracing::error!(error = ?err, "error releasing controller lease");
            }
        }
        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
    }

    /// Handle a change to the lease node made by any candidate.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_lease_change(&mut self) {
        let lease = match store::read_model::<ControllerLease>(self.store.as_ref(), &self.paths.controller_leader()).await {
            Ok(lease) => lease,
            Err(err) => {
                tracing::error!(error = ?err, "error reading controller lease");
                return;
            }
        };
        if lease != self.last_observed_lease {
            tracing::debug!("lease update observed from store");
            self.last_observed_change = Utc::now();
            self.update_lease(lease);
        }
    }

    /// Attempt to acquire or renew the lease.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        let path = self.paths.controller_leader();
        let observed = store::read_model::<ControllerLease>(self.store.as_ref(), &path)
            .await
            .context("error fetching lease")?;
        let now = Utc::now();
        if observed != self.last_observed_lease {
            self.last_observed_change = now;
            self.update_lease(observed.clone());
        }

        // If another holder's lease has not yet expired, then we are done here.
        let deadline_as_follower = self.last_observed_change + self.config.lease_duration;
        let (updated, expected) = match observed {
            Some((lease, _)) if lease.holder_identity != self.config.identity && deadline_as_follower > now => {
                tracing::debug!("leadership lease is held by {} and has not yet expired", lease.holder_identity);
                return Ok(());
            }
            Some((mut lease, version)) => {
                lease.renew_time = now;
                lease.lease_duration_seconds = self.config.lease_duration.num_seconds();
                if lease.holder_identity != self.config.identity {
                    lease.holder_identity = self.config.identity.clone();
                    lease.acquire_time = now;
                    lease.lease_transitions += 1;
                }
                (lease, Expected::Version(version))
            }
            None => (
                ControllerLease {
                    holder_identity: self.config.identity.clone(),
                    acquire_time: now,
                    renew_time: now,
                    lease_duration_seconds: self.config.lease_duration.num_seconds(),
                    lease_transitions: 0,
                },
                Expected::Absent,
            ),
        };

        let res = store::write_model(self.store.as_ref(), &path, &updated, expected, NodeMode::Ephemeral(self.session.clone())).await;
        let version = match res {
            Ok(version) => version,
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::BadVersion { .. }) | Some(StoreError::NodeExists(_)) | Some(StoreError::NoNode(_)) => {
                    tracing::debug!("lease changed concurrently, re-reading");
                    self.handle_lease_change().await;
                    return Ok(());
                }
                _ => return Err(err.context("error updating lease")),
            },
        };
        self.last_observed_change = now;
        self.update_lease(Some((updated, version)));
        Ok(())
    }

    /// Update the last observed lease, along with this elector's leadership state.
    fn update_lease(&mut self, lease: Option<(ControllerLease, i64)>) {
        self.last_observed_lease = lease;
        let holder = match &self.last_observed_lease {
            Some((lease, _)) => {
                metrics::gauge!(METRIC_LEADERSHIP_CHANGE, lease.lease_transitions as f64);
                lease.holder_identity.clone()
            }
            None => {
                if !matches!(self.state, LeaderState::Standby) {
                    self.set_state(LeaderState::Standby);
                }
                return;
            }
        };
        let lease_is_held = holder == self.config.identity;
        let state_opt = match &self.state {
            LeaderState::Leading if lease_is_held => None,
            LeaderState::Following(id) if id == &holder => None,
            LeaderState::Following(_) | LeaderState::Standby if lease_is_held => Some(LeaderState::Leading),
            LeaderState::Leading | LeaderState::Following(_) | LeaderState::Standby => Some(LeaderState::Following(holder)),
        };
        if let Some(state) = state_opt {
            tracing::info!(state = ?state, "controller leadership changed");
            self.set_state(state);
        }
    }

    /// Get the duration to delay before attempting the next lease update.
    fn get_next_acquire_renew_time(&self) -> std::time::Duration {
        let now = Utc::now();
        let addend = match &self.state {
            LeaderState::Leading => self.config.renew_deadline,
            _ => self.config.lease_duration,
        };
        let deadline = self.last_observed_change + addend;
        (deadline - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        let is_leader = if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, is_leader);
    }
}
