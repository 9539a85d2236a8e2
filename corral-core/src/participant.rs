//! Worker node participation.
//!
//! A participant wraps the state machine engine of one node. It registers the node with the
//! cluster, executes the transition messages delivered to it, and publishes the resulting
//! current states for the controller and verifier to observe.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::controller::MessageTransport;
use crate::engine::{Ack, StateMachineEngine, TransitionMessage};
use crate::error::{AppError, StoreError};
use crate::models::{CurrentState, InstanceConfig, InstanceHistory, LiveInstance};
use crate::paths::PathBuilder;
use crate::store::{self, Expected, NodeMode, StoreRef};
use crate::utils;

/// A node taking part in a cluster.
#[derive(Clone)]
pub struct Participant {
    inner: Arc<ParticipantInner>,
}

struct ParticipantInner {
    store: StoreRef,
    paths: PathBuilder,
    engine: StateMachineEngine,
    /// The session of the current membership, if joined.
    session: RwLock<Option<String>>,
    /// Serializes current state publication.
    publish: Mutex<()>,
}

impl Participant {
    pub fn new(store: StoreRef, paths: PathBuilder, engine: StateMachineEngine) -> Self {
        Self {
            inner: Arc::new(ParticipantInner {
                store,
                paths,
                engine,
                session: RwLock::new(None),
                publish: Mutex::new(()),
            }),
        }
    }

    /// The name of this participant's node.
    pub fn name(&self) -> &str {
        self.inner.engine.node()
    }

    pub fn engine(&self) -> &StateMachineEngine {
        &self.inner.engine
    }

    /// The session of the current membership.
    pub async fn session(&self) -> Option<String> {
        self.inner.session.read().await.clone()
    }

    /// Join the cluster, returning the new session.
    ///
    /// The given instance config is created if the node has none yet. Current states left behind
    /// by a previous session are replaced by the states held by this participant's engine.
    #[tracing::instrument(level = "debug", skip(self, config), fields(node = self.name()))]
    pub async fn join(&self, config: InstanceConfig) -> Result<String> {
        let (store, paths, node) = (self.inner.store.as_ref(), &self.inner.paths, self.name());
        let mut session_guard = self.inner.session.write().await;
        if session_guard.is_some() {
            return Err(AppError::Precondition(format!("node {} has already joined", node)).into());
        }

        if let Err(err) = store::write_model(store, &paths.instance_config(node), &config, Expected::Absent, NodeMode::Persistent).await {
            match err.downcast_ref::<StoreError>() {
                Some(StoreError::NodeExists(_)) => (),
                _ => return Err(err),
            }
        }
        for resource in store.children(&paths.current_states(node)).await? {
            let path = paths.current_state(node, &resource);
            if let Err(err) = store.delete(&path, Expected::Any).await {
                tracing::warn!(error = ?err, path = %path, "error clearing stale current state");
            }
        }

        let session = Uuid::new_v4().to_string();
        let live = LiveInstance {
            instance_name: node.to_string(),
            session_id: session.clone(),
        };
        if let Err(err) = store::write_model(store, &paths.live_instance(node), &live, Expected::Absent, NodeMode::Ephemeral(session.clone())).await {
            return match err.downcast_ref::<StoreError>() {
                Some(StoreError::NodeExists(_)) => Err(AppError::Precondition(format!("node {} is already live", node)).into()),
                _ => Err(err),
            };
        }
        self.record_history(|history| history.last_online_ms = Some(utils::now_ms())).await?;
        // Replicas which survived a rejoin are reported under the new session.
        for resource in self.inner.engine.resources() {
            self.publish(&resource, &session).await?;
        }

        tracing::info!(node, session = %session, "node joined cluster");
        *session_guard = Some(session.clone());
        Ok(session)
    }

    /// Leave the cluster, recording the time the node went offline.
    #[tracing::instrument(level = "debug", skip(self), fields(node = self.name()))]
    pub async fn leave(&self) -> Result<()> {
        let mut session_guard = self.inner.session.write().await;
        let session = match session_guard.take() {
            Some(session) => session,
            None => return Err(AppError::Precondition(format!("node {} has not joined", self.name())).into()),
        };
        self.record_history(|history| history.last_offline_ms = Some(utils::now_ms())).await?;
        self.inner.store.close_session(&session).await?;
        tracing::info!(node = self.name(), "node left cluster");
        Ok(())
    }

    /// Execute a transition message and publish the resulting state.
    pub async fn handle(&self, message: &TransitionMessage) -> Ack {
        let session = match self.session().await {
            Some(session) => session,
            None => {
                tracing::warn!(node = self.name(), message = %message.id, "rejecting message delivered to a node which has not joined");
                return Ack::Error;
            }
        };
        let res = self.inner.engine.on_transition_message(message).await;
        if let Err(err) = self.publish(&message.resource, &session).await {
            tracing::error!(error = ?err, node = self.name(), resource = %message.resource, "error publishing current state");
        }
        Ack::from_result(&res)
    }

    /// Reset an errored replica to its initial state.
    pub async fn reset(&self, resource: &str, partition: &str) -> Result<()> {
        let session = self
            .session()
            .await
            .ok_or_else(|| AppError::Precondition(format!("node {} has not joined", self.name())))?;
        self.inner.engine.reset(resource, partition).await?;
        self.publish(resource, &session).await
    }

    async fn publish(&self, resource: &str, session: &str) -> Result<()> {
        let _guard = self.inner.publish.lock().await;
        let current = CurrentState {
            resource_name: resource.to_string(),
            session_id: session.to_string(),
            partition_states: self.inner.engine.current_states(resource),
        };
        let path = self.inner.paths.current_state(self.name(), resource);
        store::write_model(self.inner.store.as_ref(), &path, &current, Expected::Any, NodeMode::Persistent).await?;
        Ok(())
    }

    async fn record_history(&self, f: impl FnOnce(&mut InstanceHistory) + Send + 'static) -> Result<()> {
        let path = self.inner.paths.instance_history(self.name());
        let updater = store::model_updater(move |history: Option<InstanceHistory>| {
            let mut history = history.unwrap_or_default();
            f(&mut history);
            Ok(history)
        });
        let results = self.inner.store.batch_update(&[path.clone()], vec![updater], NodeMode::Persistent).await;
        if results != [true] {
            return Err(anyhow!("error updating instance history at {}", path));
        }
        Ok(())
    }
}

/// Delivers messages to participants of the same process.
#[derive(Clone, Default)]
pub struct LocalTransport {
    participants: Arc<DashMap<String, Participant>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for the participant's node to it, replacing any previous participant.
    pub fn register(&self, participant: Participant) {
        self.participants.insert(participant.name().to_string(), participant);
    }

    /// Stop routing messages to the given node.
    pub fn deregister(&self, node: &str) -> Option<Participant> {
        self.participants.remove(node).map(|(_, participant)| participant)
    }
}

#[async_trait]
impl MessageTransport for LocalTransport {
    async fn send(&self, message: TransitionMessage) -> Result<Ack> {
        let participant = match self.participants.get(&message.target_node) {
            Some(participant) => participant.value().clone(),
            None => return Err(anyhow!("no participant registered for node {}", message.target_node)),
        };
        Ok(participant.handle(&message).await)
    }
}
