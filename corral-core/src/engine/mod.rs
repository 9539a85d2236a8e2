//! The state machine engine.
//!
//! Each node runs one engine. The engine holds one live state model instance per partition
//! replica which the node owns, dispatches transition messages to the matching instance, and
//! tracks which instances have moved to their error state. Transitions of the same instance are
//! strictly serialized, transitions of distinct instances run independently.

#[cfg(test)]
mod mod_test;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::AppError;
use crate::statemodel::{StateModelDefinition, StateModelFactory, TransitionFailure, TransitionFuture};

pub const METRIC_TRANSITION_ERRORS: &str = "corral_transition_errors";
pub const METRIC_TRANSITIONS_COMPLETED: &str = "corral_transitions_completed";

/// A command to move one partition replica from one state to another.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TransitionMessage {
    /// The unique ID of this message.
    pub id: Uuid,
    /// The resource of the target partition.
    pub resource: String,
    /// The target partition.
    pub partition: String,
    /// The state the sender observed the replica to be in.
    pub from_state: String,
    /// The state to move the replica to.
    pub to_state: String,
    /// The node hosting the replica.
    pub target_node: String,
    /// The state model governing the replica.
    pub state_model: String,
    /// The session of the sender.
    #[serde(default)]
    pub session_id: String,
}

impl TransitionMessage {
    pub fn new(
        resource: impl Into<String>, partition: impl Into<String>, from_state: impl Into<String>, to_state: impl Into<String>,
        target_node: impl Into<String>, state_model: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.into(),
            partition: partition.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            target_node: target_node.into(),
            state_model: state_model.into(),
            session_id: String::new(),
        }
    }
}

/// Errors of transition processing.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// No transition is bound to the requested edge, or the message is stale. State is unchanged.
    #[error("invalid transition {from} -> {to} for {resource}/{partition}")]
    InvalidTransition { resource: String, partition: String, from: String, to: String },
    /// The transition handler failed. The instance moved to its error state.
    #[error("transition {from} -> {to} for {resource}/{partition} failed: {cause}")]
    ApplicationTransition {
        resource: String,
        partition: String,
        from: String,
        to: String,
        cause: anyhow::Error,
    },
    /// The transition was interrupted and abandoned. State is unchanged, the message may be retried.
    #[error("transition {from} -> {to} for {resource}/{partition} was rolled back")]
    Rollback { resource: String, partition: String, from: String, to: String },
    /// The instance was dropped and no longer exists on this node.
    #[error("unknown instance {resource}/{partition}")]
    UnknownInstance { resource: String, partition: String },
    /// No factory is registered for the message's state model.
    #[error("no factory registered for state model {0}")]
    UnknownStateModel(String),
    /// The message targets a different node.
    #[error("message targets node {found} but this engine runs on {expected}")]
    WrongNode { expected: String, found: String },
}

/// The acknowledgement returned to the sender of a transition message.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ack {
    Completed,
    Error,
    Retry,
}

impl Ack {
    /// Map the outcome of a transition to its acknowledgement.
    pub fn from_result<T>(res: &Result<T>) -> Self {
        match res {
            Ok(_) => Self::Completed,
            Err(err) => match err.downcast_ref::<TransitionError>() {
                Some(TransitionError::Rollback { .. }) => Self::Retry,
                _ => Self::Error,
            },
        }
    }
}

/// The key of a partition replica instance on a node.
type InstanceKey = (String, String);

/// A state machine engine of a single node.
#[derive(Clone)]
pub struct StateMachineEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    /// The node this engine runs on.
    node: String,
    /// Registered factories, keyed by state model name.
    factories: DashMap<String, Arc<dyn ErasedFactory>>,
    /// Live instances.
    instances: DashMap<InstanceKey, Arc<Mutex<Slot>>>,
    /// Mirror of the state of each live instance, readable while a transition is in flight.
    states: DashMap<InstanceKey, String>,
    /// Instances which reached their dropped state.
    dropped: StdMutex<HashSet<InstanceKey>>,
    /// Interrupt signals of in-flight transitions.
    inflight: DashMap<InstanceKey, Arc<Notify>>,
}

/// A live instance.
struct Slot {
    state: String,
    /// The state model governing this instance.
    state_model: String,
    /// Set once the instance has been dropped, rejecting messages which queued behind the drop.
    removed: bool,
    model: Box<dyn ErasedModel>,
}

impl StateMachineEngine {
    /// Create a new engine for the given node.
    pub fn new(node: impl Into<String>) -> Self {
        metrics::register_counter!(METRIC_TRANSITION_ERRORS, metrics::Unit::Count, "transitions which moved an instance to its error state");
        metrics::register_counter!(METRIC_TRANSITIONS_COMPLETED, metrics::Unit::Count, "transitions completed successfully");
        Self {
            inner: Arc::new(EngineInner {
                node: node.into(),
                factories: DashMap::new(),
                instances: DashMap::new(),
                states: DashMap::new(),
                dropped: StdMutex::new(HashSet::new()),
                inflight: DashMap::new(),
            }),
        }
    }

    /// The node this engine runs on.
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Register a factory under the given state model name.
    pub fn register_factory<F: StateModelFactory>(&self, name: impl Into<String>, factory: F) -> Result<()> {
        let name = name.into();
        if factory.transitions().model() != factory.definition().name() {
            return Err(AppError::InvalidArgument(format!(
                "transition table of {} was built for {} but the factory defines {}",
                name,
                factory.transitions().model(),
                factory.definition().name()
            ))
            .into());
        }
        match self.inner.factories.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AppError::InvalidArgument(format!("a factory is already registered for state model {}", name)).into())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(TypedFactory(Arc::new(factory))));
                Ok(())
            }
        }
    }

    /// The definition registered under the given state model name.
    pub fn definition(&self, name: &str) -> Option<StateModelDefinition> {
        self.inner.factories.get(name).map(|factory| factory.definition().clone())
    }

    /// Handle a transition message, returning the new state of the instance.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(resource = %msg.resource, partition = %msg.partition, from = %msg.from_state, to = %msg.to_state))]
    pub async fn on_transition_message(&self, msg: &TransitionMessage) -> Result<String> {
        let res = self.apply(msg).await;
        match &res {
            Ok(_) => metrics::increment_counter!(METRIC_TRANSITIONS_COMPLETED),
            Err(err @ TransitionError::ApplicationTransition { .. }) => {
                metrics::increment_counter!(METRIC_TRANSITION_ERRORS);
                tracing::error!(error = %err, node = %self.inner.node, "transition failed, instance moved to error state");
            }
            Err(err) => tracing::warn!(error = %err, node = %self.inner.node, "transition rejected"),
        }
        res.map_err(anyhow::Error::from)
    }

    async fn apply(&self, msg: &TransitionMessage) -> std::result::Result<String, TransitionError> {
        if msg.target_node != self.inner.node {
            return Err(TransitionError::WrongNode {
                expected: self.inner.node.clone(),
                found: msg.target_node.clone(),
            });
        }
        let factory = self
            .inner
            .factories
            .get(&msg.state_model)
            .map(|factory| factory.value().clone())
            .ok_or_else(|| TransitionError::UnknownStateModel(msg.state_model.clone()))?;
        let definition = factory.definition();
        let key = (msg.resource.clone(), msg.partition.clone());
        let invalid = |from: &str| TransitionError::InvalidTransition {
            resource: msg.resource.clone(),
            partition: msg.partition.clone(),
            from: from.to_string(),
            to: msg.to_state.clone(),
        };

        // A dropped instance is only recreated by a fresh assignment starting from the initial state.
        if self.is_dropped(&key) && msg.from_state != definition.initial_state() {
            return Err(TransitionError::UnknownInstance {
                resource: msg.resource.clone(),
                partition: msg.partition.clone(),
            });
        }
        // An unknown instance is in the initial state, no slot is created for a message it rejects.
        if !self.inner.instances.contains_key(&key) {
            let initial = definition.initial_state();
            if msg.from_state != initial || !definition.is_edge(initial, &msg.to_state) {
                return Err(invalid(initial));
            }
            if let Ok(mut dropped) = self.inner.dropped.lock() {
                dropped.remove(&key);
            }
        }
        let slot = self
            .inner
            .instances
            .entry(key.clone())
            .or_insert_with(|| {
                self.inner.states.insert(key.clone(), definition.initial_state().to_string());
                Arc::new(Mutex::new(Slot {
                    state: definition.initial_state().to_string(),
                    state_model: msg.state_model.clone(),
                    removed: false,
                    model: factory.create(&msg.resource, &msg.partition),
                }))
            })
            .value()
            .clone();

        let mut slot = slot.lock().await;
        if slot.removed {
            return Err(TransitionError::UnknownInstance {
                resource: msg.resource.clone(),
                partition: msg.partition.clone(),
            });
        }
        if slot.state != msg.from_state || !definition.is_edge(&slot.state, &msg.to_state) {
            return Err(invalid(&slot.state));
        }

        let interrupt = Arc::new(Notify::new());
        let outcome = {
            let fut = match slot.model.apply(msg) {
                Some(fut) => fut,
                None => return Err(invalid(&msg.from_state)),
            };
            self.inner.inflight.insert(key.clone(), interrupt.clone());
            let outcome = tokio::select! {
                res = fut => res,
                _ = interrupt.notified() => Err(TransitionFailure::Interrupted),
            };
            self.inner.inflight.remove(&key);
            outcome
        };

        match outcome {
            Ok(()) => {
                slot.state = msg.to_state.clone();
                if msg.to_state == definition.dropped_state() {
                    slot.removed = true;
                    self.inner.instances.remove(&key);
                    self.inner.states.remove(&key);
                    if let Ok(mut dropped) = self.inner.dropped.lock() {
                        dropped.insert(key);
                    }
                } else {
                    self.inner.states.insert(key, msg.to_state.clone());
                }
                Ok(msg.to_state.clone())
            }
            Err(TransitionFailure::Interrupted) => Err(TransitionError::Rollback {
                resource: msg.resource.clone(),
                partition: msg.partition.clone(),
                from: msg.from_state.clone(),
                to: msg.to_state.clone(),
            }),
            Err(TransitionFailure::Application(cause)) => {
                slot.state = definition.error_state().to_string();
                self.inner.states.insert(key, slot.state.clone());
                Err(TransitionError::ApplicationTransition {
                    resource: msg.resource.clone(),
                    partition: msg.partition.clone(),
                    from: msg.from_state.clone(),
                    to: msg.to_state.clone(),
                    cause,
                })
            }
        }
    }

    /// Interrupt the in-flight transition of the given instance, if any.
    ///
    /// The interrupted transition is abandoned with a rollback. Returns `true` if a transition
    /// was in flight.
    pub fn interrupt(&self, resource: &str, partition: &str) -> bool {
        match self.inner.inflight.remove(&(resource.to_string(), partition.to_string())) {
            Some((_, notify)) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Move an instance in its error state back to its initial state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reset(&self, resource: &str, partition: &str) -> Result<()> {
        let key = (resource.to_string(), partition.to_string());
        let slot = match self.inner.instances.get(&key) {
            Some(slot) => slot.value().clone(),
            None => {
                return Err(TransitionError::UnknownInstance {
                    resource: resource.into(),
                    partition: partition.into(),
                }
                .into())
            }
        };
        let mut slot = slot.lock().await;
        let definition = self
            .definition(&slot.state_model)
            .ok_or_else(|| TransitionError::UnknownStateModel(slot.state_model.clone()))?;
        if slot.state != definition.error_state() {
            return Err(AppError::Precondition(format!("instance {}/{} is {}, not {}", resource, partition, slot.state, definition.error_state())).into());
        }
        slot.state = definition.initial_state().to_string();
        self.inner.states.insert(key, slot.state.clone());
        tracing::info!(resource, partition, state = %slot.state, "reset instance from error state");
        Ok(())
    }

    /// The current state of the given instance.
    pub fn current_state(&self, resource: &str, partition: &str) -> Option<String> {
        self.inner
            .states
            .get(&(resource.to_string(), partition.to_string()))
            .map(|state| state.value().clone())
    }

    /// The current state of every live instance of the given resource, keyed by partition.
    pub fn current_states(&self, resource: &str) -> BTreeMap<String, String> {
        self.inner
            .states
            .iter()
            .filter(|entry| entry.key().0 == resource)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    /// The resources which have live instances on this engine.
    pub fn resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.inner.states.iter().map(|entry| entry.key().0.clone()).collect();
        resources.sort();
        resources.dedup();
        resources
    }

    /// All instances currently in an error state, as sorted `(resource, partition)` pairs.
    pub fn error_instances(&self) -> Vec<(String, String)> {
        let error_states: HashSet<String> = self
            .inner
            .factories
            .iter()
            .map(|factory| factory.value().definition().error_state().to_string())
            .collect();
        let mut instances: Vec<(String, String)> = self
            .inner
            .states
            .iter()
            .filter(|entry| error_states.contains(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        instances.sort();
        instances
    }

    fn is_dropped(&self, key: &InstanceKey) -> bool {
        self.inner.dropped.lock().map(|dropped| dropped.contains(key)).unwrap_or(false)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Type erasure ////////////////////////////////////////////////////////////

/// A registered factory with its model type erased.
trait ErasedFactory: Send + Sync {
    fn definition(&self) -> &StateModelDefinition;
    fn create(&self, resource: &str, partition: &str) -> Box<dyn ErasedModel>;
}

/// A live model instance with its type erased.
trait ErasedModel: Send {
    /// Start the transition of the given message, `None` when no handler is bound to its edge.
    fn apply<'a>(&'a mut self, msg: &'a TransitionMessage) -> Option<TransitionFuture<'a>>;
}

struct TypedFactory<F>(Arc<F>);

struct TypedModel<F: StateModelFactory> {
    factory: Arc<F>,
    model: F::Model,
}

impl<F: StateModelFactory> ErasedFactory for TypedFactory<F> {
    fn definition(&self) -> &StateModelDefinition {
        self.0.definition()
    }

    fn create(&self, resource: &str, partition: &str) -> Box<dyn ErasedModel> {
        Box::new(TypedModel {
            factory: self.0.clone(),
            model: self.0.create_model(resource, partition),
        })
    }
}

impl<F: StateModelFactory> ErasedModel for TypedModel<F> {
    fn apply<'a>(&'a mut self, msg: &'a TransitionMessage) -> Option<TransitionFuture<'a>> {
        let handler = self.factory.transitions().handler(&msg.from_state, &msg.to_state)?;
        Some(handler(&mut self.model, msg))
    }
}
