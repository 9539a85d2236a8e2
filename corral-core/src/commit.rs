//! Config commit protocol.
//!
//! Multi path config mutations are applied as a batch of independent per path updates while the
//! cluster is held in maintenance mode. The batch is not atomic across paths: every path either
//! commits or fails on its own and failures are reported by path. The trailing cluster config
//! write is only attempted once every instance path has committed.

use anyhow::Result;

use crate::error::{AppError, StoreError};
use crate::maintenance::Maintenance;
use crate::models::ClusterConfig;
use crate::paths::PathBuilder;
use crate::store::{self, DataUpdater, Expected, NodeMode, StoreRef};

/// Applies config mutations under the maintenance lock.
#[derive(Clone)]
pub struct ConfigCommit {
    store: StoreRef,
    paths: PathBuilder,
    maintenance: Maintenance,
}

impl ConfigCommit {
    pub fn new(store: StoreRef, paths: PathBuilder) -> Self {
        let maintenance = Maintenance::new(store.clone(), paths.clone());
        Self { store, paths, maintenance }
    }

    /// Apply each updater to its path independently.
    ///
    /// Requires the cluster to be in maintenance mode. Returns one entry per path, `true` when
    /// that path committed.
    #[tracing::instrument(level = "debug", skip(self, paths, updaters))]
    pub async fn apply_batch(&self, paths: &[String], updaters: Vec<DataUpdater>, mode: NodeMode) -> Result<Vec<bool>> {
        self.maintenance.require_held().await?;
        if paths.len() != updaters.len() {
            return Err(AppError::InvalidArgument(format!("batch has {} paths but {} updaters", paths.len(), updaters.len())).into());
        }
        Ok(self.store.batch_update(paths, updaters, mode).await)
    }

    /// Run the full commit protocol.
    ///
    /// The instance updates are applied as one batch. If any path fails, the cluster config is
    /// left untouched and `AppError::PartialCommit` names every failed path. Otherwise the
    /// maintenance lock is checked again and the cluster config is rewritten conditioned on the
    /// version which was read. Paths already committed are never rolled back.
    #[tracing::instrument(level = "debug", skip(self, instance_updates, cluster_update))]
    pub async fn commit<F>(&self, instance_updates: Vec<(String, DataUpdater)>, cluster_update: F) -> Result<()>
    where
        F: FnOnce(ClusterConfig) -> Result<ClusterConfig> + Send,
    {
        let (paths, updaters): (Vec<String>, Vec<DataUpdater>) = instance_updates.into_iter().unzip();
        let results = self.apply_batch(&paths, updaters, NodeMode::Persistent).await?;
        let failed_paths: Vec<String> = paths.into_iter().zip(results).filter(|(_, ok)| !ok).map(|(path, _)| path).collect();
        if !failed_paths.is_empty() {
            tracing::error!(?failed_paths, "config commit failed to update instance paths");
            return Err(AppError::PartialCommit { failed_paths }.into());
        }

        // The lock may have been released by an operator while the batch ran.
        self.maintenance.require_held().await?;

        let path = self.paths.cluster_config();
        let (config, version) = match store::read_model::<ClusterConfig>(self.store.as_ref(), &path).await? {
            Some(found) => found,
            None => return Err(AppError::Precondition(format!("cluster {} has no cluster config", self.paths.cluster())).into()),
        };
        let updated = cluster_update(config)?;
        match store::write_model(self.store.as_ref(), &path, &updated, Expected::Version(version), NodeMode::Persistent).await {
            Ok(_) => Ok(()),
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::BadVersion { .. }) | Some(StoreError::NoNode(_)) => {
                    tracing::error!(error = ?err, path = %path, "config commit failed to update cluster config");
                    Err(AppError::PartialCommit { failed_paths: vec![path] }.into())
                }
                _ => Err(err),
            },
        }
    }
}
