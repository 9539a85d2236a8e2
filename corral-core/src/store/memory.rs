use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::store::{CoordinationStore, Expected, NodeMode, StoreEvent, Versioned, EVENT_CHANNEL_CAPACITY};

/// An in-memory coordination store.
///
/// Used for tests and single process clusters. Supports injecting version conflicts on
/// specific paths, and records the number of write attempts made against each path.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    events: broadcast::Sender<StoreEvent>,
}

#[derive(Default)]
struct MemoryInner {
    nodes: BTreeMap<String, MemoryNode>,
    /// Paths whose next conditional write will fail with a bad version.
    conflicts: HashSet<String>,
    /// The number of write attempts made against each path.
    write_attempts: HashMap<String, usize>,
}

struct MemoryNode {
    data: Vec<u8>,
    version: i64,
    owner: Option<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(MemoryInner::default()),
            events,
        }
    }

    /// Cause the next conditional write to the given path to fail as if a concurrent writer had
    /// bumped its version.
    pub fn inject_bad_version(&self, path: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.conflicts.insert(path.into());
        }
    }

    /// The number of write attempts made against the given path.
    pub fn write_attempts(&self, path: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.write_attempts.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Versioned>> {
        let inner = self.lock()?;
        Ok(inner.nodes.get(path).map(|node| Versioned {
            data: node.data.clone(),
            version: node.version,
        }))
    }

    async fn write(&self, path: &str, data: Vec<u8>, expected: Expected, mode: NodeMode) -> Result<i64> {
        let version = {
            let mut inner = self.lock()?;
            *inner.write_attempts.entry(path.to_string()).or_insert(0) += 1;
            let found = inner.nodes.get(path).map(|node| node.version);
            if !matches!(expected, Expected::Any) && inner.conflicts.remove(path) {
                let found = found.map(|val| val + 1).unwrap_or(0);
                let expected = if let Expected::Version(val) = expected { val } else { -1 };
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    found,
                }
                .into());
            }
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
            let owner = match mode {
                NodeMode::Persistent => None,
                NodeMode::Ephemeral(session) => Some(session),
            };
            inner.nodes.insert(path.to_string(), MemoryNode { data, version, owner });
            version
        };
        self.emit(StoreEvent::Changed {
            path: path.to_string(),
            version,
        });
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Expected) -> Result<()> {
        {
            let mut inner = self.lock()?;
            let found = match inner.nodes.get(path) {
                Some(node) => node.version,
                None => return Err(StoreError::NoNode(path.to_string()).into()),
            };
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
            inner.nodes.remove(path);
        }
        self.emit(StoreEvent::Deleted { path: path.to_string() });
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children: BTreeSet<String> = inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next().map(String::from))
            .filter(|child| !child.is_empty())
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn close_session(&self, session: &str) -> Result<()> {
        let removed: Vec<String> = {
            let mut inner = self.lock()?;
            let owned: Vec<String> = inner
                .nodes
                .iter()
                .filter(|(_, node)| node.owner.as_deref() == Some(session))
                .map(|(key, _)| key.clone())
                .collect();
            for key in owned.iter() {
                inner.nodes.remove(key);
            }
            owned
        };
        for path in removed {
            self.emit(StoreEvent::Deleted { path });
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
