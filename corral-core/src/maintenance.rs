//! Cluster maintenance mode.
//!
//! Maintenance mode is a cluster wide advisory lock. While the maintenance record exists the
//! controller does not rebalance, and disruptive config mutations may proceed.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::{AppError, StoreError};
use crate::models::{MaintenanceSignal, MaintenanceTrigger};
use crate::paths::PathBuilder;
use crate::store::{self, Expected, NodeMode, StoreRef};
use crate::utils;

/// A handle to the maintenance mode of a cluster.
#[derive(Clone)]
pub struct Maintenance {
    store: StoreRef,
    paths: PathBuilder,
}

impl Maintenance {
    pub fn new(store: StoreRef, paths: PathBuilder) -> Self {
        Self { store, paths }
    }

    /// Check if the cluster is in maintenance mode.
    pub async fn is_in_maintenance(&self) -> Result<bool> {
        Ok(self.signal().await?.is_some())
    }

    /// The current maintenance record, if any.
    pub async fn signal(&self) -> Result<Option<MaintenanceSignal>> {
        let signal = store::read_model::<MaintenanceSignal>(self.store.as_ref(), &self.paths.maintenance()).await?;
        Ok(signal.map(|(signal, _)| signal))
    }

    /// Put the cluster into maintenance mode.
    ///
    /// Fails with `AppError::Precondition` if the cluster is already in maintenance mode.
    #[tracing::instrument(level = "debug", skip(self, custom_fields))]
    pub async fn enter(&self, reason: &str, triggered_by: MaintenanceTrigger, custom_fields: BTreeMap<String, String>) -> Result<()> {
        let signal = MaintenanceSignal {
            reason: reason.into(),
            triggered_by,
            timestamp_ms: utils::now_ms(),
            custom_fields,
        };
        let path = self.paths.maintenance();
        match store::write_model(self.store.as_ref(), &path, &signal, Expected::Absent, NodeMode::Persistent).await {
            Ok(_) => {
                tracing::info!(cluster = self.paths.cluster(), reason, "cluster entered maintenance mode");
                Ok(())
            }
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::NodeExists(_)) => {
                    Err(AppError::Precondition(format!("cluster {} is already in maintenance mode", self.paths.cluster())).into())
                }
                _ => Err(err),
            },
        }
    }

    /// Take the cluster out of maintenance mode.
    ///
    /// Fails with `AppError::Precondition` if the cluster is not in maintenance mode.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn exit(&self) -> Result<()> {
        match self.store.delete(&self.paths.maintenance(), Expected::Any).await {
            Ok(()) => {
                tracing::info!(cluster = self.paths.cluster(), "cluster exited maintenance mode");
                Ok(())
            }
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::NoNode(_)) => Err(AppError::Precondition(format!("cluster {} is not in maintenance mode", self.paths.cluster())).into()),
                _ => Err(err),
            },
        }
    }

    /// Fail with `AppError::Precondition` unless the cluster is in maintenance mode.
    pub async fn require_held(&self) -> Result<()> {
        if !self.is_in_maintenance().await? {
            return Err(AppError::Precondition(format!("cluster {} must be in maintenance mode", self.paths.cluster())).into());
        }
        Ok(())
    }
}
