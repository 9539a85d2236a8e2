//! A coordination store persisted in sled.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sled::{Config as SledConfig, Db, IVec, Tree};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::store::{CoordinationStore, Expected, NodeMode, StoreEvent, Versioned, EVENT_CHANNEL_CAPACITY};
use crate::utils;

/// The DB tree holding all store nodes.
const TREE_NODES: &str = "nodes";
/// The DB tree mapping ephemeral node paths to their owning session.
const TREE_EPHEMERAL: &str = "ephemeral";
/// The byte length of the version prefix of every stored value.
const VERSION_LEN: usize = 8;
/// The number of attempts made to open the DB while its file lock is held.
const OPEN_ATTEMPTS: u32 = 50;
/// The pause between attempts to open the DB.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(20);

/// A coordination store backed by a sled database.
///
/// Each value is stored as its big-endian i64 version followed by its data. Ephemeral nodes are
/// tracked in a separate tree and purged on open, as no session survives a restart.
#[derive(Clone)]
pub struct SledStore {
    inner: Arc<SledInner>,
}

struct SledInner {
    /// The underlying DB handle.
    db: Db,
    /// The tree of store nodes.
    nodes: Tree,
    /// The tree of ephemeral node owners.
    ephemeral: Tree,
    /// The channel of store events.
    events: broadcast::Sender<StoreEvent>,
}

impl SledStore {
    /// Open the store at the given path, creating it as needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let dbpath = path.into();
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for coordination store")?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let db = open_db(SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput))?;
            let nodes = db.open_tree(TREE_NODES).context("error opening nodes tree")?;
            let ephemeral = db.open_tree(TREE_EPHEMERAL).context("error opening ephemeral tree")?;
            for kv_res in ephemeral.iter() {
                let (key, _) = kv_res.context("error iterating ephemeral nodes")?;
                nodes.remove(&key).context("error purging stale ephemeral node")?;
            }
            ephemeral.clear().context("error clearing ephemeral tree")?;
            let inner = Arc::new(SledInner { db, nodes, ephemeral, events });
            Ok(Self { inner })
        })
        .await
        .context("error joining store open task")?
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.inner.db.flush_async().await.context("error flushing coordination store")?;
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// Open the DB of the given config.
///
/// A DB handle which was just dropped may still hold the file lock until its background flusher
/// exits, so IO failures are retried for a bounded number of attempts.
fn open_db(config: SledConfig) -> Result<Db> {
    let mut attempt = 1;
    loop {
        match config.open() {
            Ok(db) => return Ok(db),
            Err(sled::Error::Io(err)) if attempt < OPEN_ATTEMPTS => {
                tracing::debug!(error = ?err, attempt, "error opening coordination store, retrying");
                attempt += 1;
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
            Err(err) => return Err(err).context("error opening coordination store DB"),
        }
    }
}

/// Encode a stored value.
fn encode_value(version: i64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VERSION_LEN + data.len());
    buf.extend_from_slice(&utils::encode_i64(version));
    buf.extend_from_slice(data);
    buf
}

/// Decode a stored value.
fn decode_value(val: &[u8]) -> Result<Versioned> {
    if val.len() < VERSION_LEN {
        anyhow::bail!("stored value too short, len {} needed at least {}", val.len(), VERSION_LEN);
    }
    let version = utils::decode_i64(&val[..VERSION_LEN])?;
    Ok(Versioned {
        data: val[VERSION_LEN..].to_vec(),
        version,
    })
}

#[async_trait]
impl CoordinationStore for SledStore {
    async fn read(&self, path: &str) -> Result<Option<Versioned>> {
        match self.inner.nodes.get(path).context("error reading from store")? {
            Some(val) => Ok(Some(decode_value(&val)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, path: &str, data: Vec<u8>, expected: Expected, mode: NodeMode) -> Result<i64> {
        let version = loop {
            let current: Option<IVec> = self.inner.nodes.get(path).context("error reading from store")?;
            let found = match current.as_ref() {
                Some(val) => Some(decode_value(val)?.version),
                None => None,
            };
            let version = match (expected, found) {
                (Expected::Any, found) => found.map(|val| val + 1).unwrap_or(0),
                (Expected::Absent, None) => 0,
                (Expected::Absent, Some(_)) => return Err(StoreError::NodeExists(path.to_string()).into()),
                (Expected::Version(_), None) => return Err(StoreError::NoNode(path.to_string()).into()),
                (Expected::Version(val), Some(found)) if val == found => found + 1,
                (Expected::Version(val), Some(found)) => {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected: val,
                        found,
                    }
                    .into())
                }
            };
            let swap = self
                .inner
                .nodes
                .compare_and_swap(path, current, Some(encode_value(version, &data)))
                .context("error writing to store")?;
            match swap {
                Ok(()) => break version,
                // A concurrent writer won, re-evaluate the expectation against its write.
                Err(_) => continue,
            }
        };
        match mode {
            NodeMode::Persistent => {
                self.inner.ephemeral.remove(path).context("error updating ephemeral tree")?;
            }
            NodeMode::Ephemeral(session) => {
                self.inner
                    .ephemeral
                    .insert(path, session.as_bytes())
                    .context("error updating ephemeral tree")?;
            }
        }
        self.emit(StoreEvent::Changed {
            path: path.to_string(),
            version,
        });
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Expected) -> Result<()> {
        loop {
            let current = match self.inner.nodes.get(path).context("error reading from store")? {
                Some(current) => current,
                None => return Err(StoreError::NoNode(path.to_string()).into()),
            };
            let found = decode_value(&current)?.version;
            match expected {
                Expected::Version(val) if val != found => {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected: val,
                        found,
                    }
                    .into())
                }
                Expected::Absent => return Err(StoreError::NodeExists(path.to_string()).into()),
                _ => (),
            }
            let swap = self
                .inner
                .nodes
                .compare_and_swap(path, Some(current), None as Option<IVec>)
                .context("error deleting from store")?;
            if swap.is_ok() {
                break;
            }
        }
        self.inner.ephemeral.remove(path).context("error updating ephemeral tree")?;
        self.emit(StoreEvent::Deleted { path: path.to_string() });
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children = BTreeSet::new();
        for kv_res in self.inner.nodes.scan_prefix(prefix.as_bytes()) {
            let (key, _) = kv_res.context("error scanning store")?;
            let key = String::from_utf8(key.to_vec()).context("store key is not valid utf8")?;
            if let Some(child) = key[prefix.len()..].split('/').next().filter(|child| !child.is_empty()) {
                children.insert(child.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    async fn close_session(&self, session: &str) -> Result<()> {
        let mut owned = vec![];
        for kv_res in self.inner.ephemeral.iter() {
            let (key, owner) = kv_res.context("error iterating ephemeral nodes")?;
            if owner.as_ref() == session.as_bytes() {
                owned.push(key);
            }
        }
        for key in owned {
            self.inner.nodes.remove(&key).context("error removing ephemeral node")?;
            self.inner.ephemeral.remove(&key).context("error updating ephemeral tree")?;
            let path = String::from_utf8(key.to_vec()).context("store key is not valid utf8")?;
            tracing::debug!(path = %path, session, "removed ephemeral node of closed session");
            self.emit(StoreEvent::Deleted { path });
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }
}
