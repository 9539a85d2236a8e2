use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use crate::engine::TransitionMessage;
use crate::error::AppError;
use crate::statemodel::StateModelDefinition;

/// The future returned by a transition handler.
pub type TransitionFuture<'a> = BoxFuture<'a, Result<(), TransitionFailure>>;

/// A transition handler bound to a single `(from, to)` edge.
pub type TransitionHandler<M> = Arc<dyn for<'a> Fn(&'a mut M, &'a TransitionMessage) -> TransitionFuture<'a> + Send + Sync>;

/// A failure reported by a transition handler.
#[derive(Debug)]
pub enum TransitionFailure {
    /// The application failed to perform the transition. The instance moves to its error state.
    Application(anyhow::Error),
    /// The transition was cancelled. The instance keeps its state and the transition may be retried.
    Interrupted,
}

impl From<anyhow::Error> for TransitionFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::Application(err)
    }
}

/// An explicit `(from, to) -> handler` table of a state model type.
pub struct TransitionTable<M> {
    /// The name of the definition this table was validated against.
    model: String,
    handlers: HashMap<(String, String), TransitionHandler<M>>,
}

impl<M> TransitionTable<M> {
    /// Start building a table validated against the given definition.
    pub fn builder(definition: &StateModelDefinition) -> TransitionTableBuilder<'_, M> {
        TransitionTableBuilder {
            definition,
            handlers: HashMap::new(),
            errors: vec![],
        }
    }

    /// The name of the definition this table was built against.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The handler bound to the given edge.
    pub fn handler(&self, from: &str, to: &str) -> Option<TransitionHandler<M>> {
        self.handlers.get(&(from.to_string(), to.to_string())).cloned()
    }

    /// The number of bound edges.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A builder of transition tables.
pub struct TransitionTableBuilder<'a, M> {
    definition: &'a StateModelDefinition,
    handlers: HashMap<(String, String), TransitionHandler<M>>,
    errors: Vec<String>,
}

impl<'a, M> TransitionTableBuilder<'a, M> {
    /// Bind a handler to the `from -> to` edge.
    pub fn on<F>(mut self, from: &str, to: &str, handler: F) -> Self
    where
        F: for<'b> Fn(&'b mut M, &'b TransitionMessage) -> TransitionFuture<'b> + Send + Sync + 'static,
    {
        if !self.definition.has_state(from) || !self.definition.has_state(to) {
            self.errors.push(format!("transition {} -> {} names a state not declared by {}", from, to, self.definition.name()));
            return self;
        }
        if !self.definition.is_edge(from, to) {
            self.errors.push(format!("transition {} -> {} is not an edge of {}", from, to, self.definition.name()));
            return self;
        }
        let key = (from.to_string(), to.to_string());
        if self.handlers.contains_key(&key) {
            self.errors.push(format!("duplicate handler for transition {} -> {}", from, to));
            return self;
        }
        self.handlers.insert(key, Arc::new(handler));
        self
    }

    /// Validate and build the table.
    pub fn build(self) -> Result<TransitionTable<M>> {
        if !self.errors.is_empty() {
            return Err(AppError::InvalidArgument(format!(
                "invalid transition table for {}: {}",
                self.definition.name(),
                self.errors.join("; ")
            ))
            .into());
        }
        Ok(TransitionTable {
            model: self.definition.name().to_string(),
            handlers: self.handlers,
        })
    }
}

/// A factory of state model instances, registered with a state machine engine.
///
/// One model instance is created per `(resource, partition)` the first time a transition for
/// that key arrives on a node.
pub trait StateModelFactory: Send + Sync + 'static {
    /// The state held by each model instance.
    type Model: Send + 'static;

    /// The definition governing model instances.
    fn definition(&self) -> &StateModelDefinition;

    /// The transition handlers of model instances.
    fn transitions(&self) -> &TransitionTable<Self::Model>;

    /// Create a model instance for the given partition replica.
    fn create_model(&self, resource: &str, partition: &str) -> Self::Model;
}
