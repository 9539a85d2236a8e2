//! Coordination store interface.
//!
//! The coordination store is the single shared mutable resource of a cluster. It is a
//! hierarchical key space where every node carries a version which is bumped on each write.
//! Conditional writes fail with `StoreError::BadVersion` rather than overwriting newer data, and
//! ephemeral nodes are removed when their owning session is closed.

mod memory;
#[cfg(test)]
mod memory_test;
mod sled_store;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::utils;

pub use self::memory::MemoryStore;
pub use self::sled_store::SledStore;

/// A shared handle to a coordination store.
pub type StoreRef = Arc<dyn CoordinationStore>;

/// A function computing the new data of a path from its current data.
pub type DataUpdater = Box<dyn FnOnce(Option<&[u8]>) -> Result<Vec<u8>> + Send>;

/// The capacity of store event channels.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Data read from the store along with its version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: i64,
}

/// The version expectation of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expected {
    /// Write unconditionally.
    Any,
    /// The path must not exist yet.
    Absent,
    /// The path must exist with exactly this version.
    Version(i64),
}

/// Lifetime semantics of a written node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeMode {
    /// The node lives until deleted.
    Persistent,
    /// The node is removed when the given session is closed.
    Ephemeral(String),
}

/// A change observed on the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Changed { path: String, version: i64 },
    Deleted { path: String },
}

impl StoreEvent {
    /// The path affected by this event.
    pub fn path(&self) -> &str {
        match self {
            Self::Changed { path, .. } | Self::Deleted { path } => path,
        }
    }
}

/// The coordination store consumed by all components.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read the data and version of a path.
    async fn read(&self, path: &str) -> Result<Option<Versioned>>;

    /// Write data to a path, returning the new version.
    async fn write(&self, path: &str, data: Vec<u8>, expected: Expected, mode: NodeMode) -> Result<i64>;

    /// Delete a path.
    async fn delete(&self, path: &str, expected: Expected) -> Result<()>;

    /// The sorted names of the immediate children of a path.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Close a session, removing all ephemeral nodes which it owns.
    async fn close_session(&self, session: &str) -> Result<()>;

    /// Subscribe to all changes made to the store.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;

    /// Apply an updater to each path independently.
    ///
    /// Each path is read, updated and written back conditioned on the version which was read. A
    /// path whose write fails does not affect its siblings. The returned vector holds one entry
    /// per path, `true` when that path committed.
    async fn batch_update(&self, paths: &[String], updaters: Vec<DataUpdater>, mode: NodeMode) -> Vec<bool> {
        let mut results = Vec::with_capacity(paths.len());
        let mut updaters = updaters.into_iter();
        for path in paths {
            let updater = match updaters.next() {
                Some(updater) => updater,
                None => {
                    tracing::warn!(path = %path, "no updater given for path in batch update");
                    results.push(false);
                    continue;
                }
            };
            let res = async {
                let (expected, data) = match self.read(path).await? {
                    Some(current) => (Expected::Version(current.version), updater(Some(&current.data))?),
                    None => (Expected::Absent, updater(None)?),
                };
                self.write(path, data, expected, mode.clone()).await
            }
            .await;
            match res {
                Ok(_) => results.push(true),
                Err(err) => {
                    tracing::warn!(error = ?err, path = %path, "batch update of path failed");
                    results.push(false);
                }
            }
        }
        results
    }
}

/// Read and decode a model, along with its version.
pub async fn read_model<M: DeserializeOwned>(store: &dyn CoordinationStore, path: &str) -> Result<Option<(M, i64)>> {
    match store.read(path).await? {
        Some(versioned) => {
            let model = utils::decode_model(&versioned.data).with_context(|| format!("error decoding model at {}", path))?;
            Ok(Some((model, versioned.version)))
        }
        None => Ok(None),
    }
}

/// Encode and write a model.
pub async fn write_model<M: Serialize>(store: &dyn CoordinationStore, path: &str, model: &M, expected: Expected, mode: NodeMode) -> Result<i64> {
    let data = utils::encode_model(model)?;
    store.write(path, data, expected, mode).await
}

/// Read and decode every immediate child of a path, keyed by child name.
pub async fn read_children_models<M: DeserializeOwned>(store: &dyn CoordinationStore, path: &str) -> Result<BTreeMap<String, M>> {
    let mut models = BTreeMap::new();
    for child in store.children(path).await? {
        let child_path = format!("{}/{}", path, child);
        // A child may be a pure intermediate path without data of its own.
        if let Some((model, _)) = read_model(store, &child_path).await? {
            models.insert(child, model);
        }
    }
    Ok(models)
}

/// Build a `DataUpdater` which decodes, transforms and re-encodes a model.
pub fn model_updater<M, F>(f: F) -> DataUpdater
where
    M: Serialize + DeserializeOwned,
    F: FnOnce(Option<M>) -> Result<M> + Send + 'static,
{
    Box::new(move |current: Option<&[u8]>| -> Result<Vec<u8>> {
        let current = match current {
            Some(data) => Some(utils::decode_model::<M>(data)?),
            None => None,
        };
        let updated = f(current)?;
        utils::encode_model(&updated)
    })
}
