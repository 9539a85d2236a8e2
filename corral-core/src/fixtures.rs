//! Mock state models and an in-process cluster for tests and demos.
//!
//! `MockFactory` binds a handler to every edge of a definition. Each handler records the
//! transition in a shared journal, and can be configured to fail, to sleep, or to block until
//! interrupted. `ClusterHarness` runs a controller and any number of participants against a
//! `MemoryStore`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::controller::{Controller, RebalanceReport};
use crate::engine::StateMachineEngine;
use crate::models::{ClusterConfig, IdealState, InstanceConfig};
use crate::participant::{LocalTransport, Participant};
use crate::paths::PathBuilder;
use crate::statemodel::{self, StateModelDefinition, StateModelFactory, TransitionFailure, TransitionTable, STATE_OFFLINE, STATE_SLAVE};
use crate::store::{self, Expected, MemoryStore, NodeMode, StoreRef};
use crate::verifier::{ClusterVerifier, Verifier};

/// A transition observed by a mock model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    pub resource: String,
    pub partition: String,
    pub from: String,
    pub to: String,
}

/// The configurable behavior shared by all handlers of a mock factory.
#[derive(Default)]
pub struct MockBehavior {
    /// Edges whose handler fails with an application error.
    failing: HashSet<(String, String)>,
    /// Edges whose handler never completes on its own.
    blocking: HashSet<(String, String)>,
    /// Time spent in every handler.
    delay: Option<Duration>,
    /// Every completed transition, in completion order.
    journal: Mutex<Vec<TransitionRecord>>,
    /// Number of handlers currently running.
    running: AtomicUsize,
    /// The highest number of handlers observed running at once.
    max_running: AtomicUsize,
    /// Number of handlers started.
    started: AtomicUsize,
}

impl MockBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `from -> to` transition with an application error.
    pub fn fail_on(mut self, from: &str, to: &str) -> Self {
        self.failing.insert((from.into(), to.into()));
        self
    }

    /// Block every `from -> to` transition until it is interrupted.
    pub fn block_on(mut self, from: &str, to: &str) -> Self {
        self.blocking.insert((from.into(), to.into()));
        self
    }

    /// Sleep for the given duration in every handler.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// All completed transitions.
    pub fn journal(&self) -> Vec<TransitionRecord> {
        self.journal.lock().map(|journal| journal.clone()).unwrap_or_default()
    }

    /// The highest number of handlers observed running at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// The number of handlers started so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    async fn run(&self, model: &mut MockModel, from: &str, to: &str) -> Result<(), TransitionFailure> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let res = self.run_inner(model, from, to).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn run_inner(&self, model: &mut MockModel, from: &str, to: &str) -> Result<(), TransitionFailure> {
        let edge = (from.to_string(), to.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.blocking.contains(&edge) {
            futures::future::pending::<()>().await;
        }
        if self.failing.contains(&edge) {
            return Err(anyhow!("failed to move {}/{} from {} to {}", model.resource, model.partition, from, to).into());
        }
        model.transitions += 1;
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(TransitionRecord {
                resource: model.resource.clone(),
                partition: model.partition.clone(),
                from: edge.0,
                to: edge.1,
            });
        }
        Ok(())
    }
}

/// A mock model instance.
pub struct MockModel {
    pub resource: String,
    pub partition: String,
    /// The number of transitions completed by this instance.
    pub transitions: usize,
}

/// A factory of mock models which binds every edge of its definition.
pub struct MockFactory {
    definition: StateModelDefinition,
    table: TransitionTable<MockModel>,
    behavior: Arc<MockBehavior>,
}

impl MockFactory {
    /// Create a new factory for the given definition.
    pub fn new(definition: StateModelDefinition, behavior: MockBehavior) -> Result<Self> {
        let behavior = Arc::new(behavior);
        let mut builder = TransitionTable::<MockModel>::builder(&definition);
        for (from, to) in definition.edges() {
            let (behavior, edge_from, edge_to) = (behavior.clone(), from.clone(), to.clone());
            builder = builder.on(&from, &to, move |model, _msg| {
                let (behavior, from, to) = (behavior.clone(), edge_from.clone(), edge_to.clone());
                Box::pin(async move { behavior.run(model, &from, &to).await })
            });
        }
        let table = builder.build()?;
        Ok(Self { definition, table, behavior })
    }

    /// A master/slave factory whose OFFLINE -> SLAVE transition always fails.
    pub fn failing_master_slave() -> Result<Self> {
        Self::new(StateModelDefinition::master_slave(), MockBehavior::new().fail_on(STATE_OFFLINE, STATE_SLAVE))
    }

    /// The behavior shared by all handlers of this factory.
    pub fn behavior(&self) -> Arc<MockBehavior> {
        self.behavior.clone()
    }
}

impl StateModelFactory for MockFactory {
    type Model = MockModel;

    fn definition(&self) -> &StateModelDefinition {
        &self.definition
    }

    fn transitions(&self) -> &TransitionTable<MockModel> {
        &self.table
    }

    fn create_model(&self, resource: &str, partition: &str) -> MockModel {
        MockModel {
            resource: resource.into(),
            partition: partition.into(),
            transitions: 0,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Cluster Harness ///////////////////////////////////////////////////////////

/// The upper bound on rebalance passes run by `ClusterHarness::rebalance_until_stable`.
pub const MAX_REBALANCE_PASSES: usize = 32;

/// A controller and its participants, all running in process against a memory store.
pub struct ClusterHarness {
    pub store: Arc<MemoryStore>,
    pub paths: PathBuilder,
    pub transport: LocalTransport,
    pub controller: Controller,
    participants: BTreeMap<String, Participant>,
}

impl ClusterHarness {
    /// Create the cluster with the given config.
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let store_ref: StoreRef = store.clone();
        let paths = PathBuilder::new(config.cluster_name.clone());
        store::write_model(store_ref.as_ref(), &paths.cluster_config(), &config, Expected::Absent, NodeMode::Persistent).await?;
        let transport = LocalTransport::new();
        let controller = Controller::new(
            "test-controller",
            store_ref,
            paths.clone(),
            statemodel::builtin_definitions(),
            Arc::new(transport.clone()),
        );
        Ok(Self {
            store,
            paths,
            transport,
            controller,
            participants: BTreeMap::new(),
        })
    }

    /// The store as a shared handle.
    pub fn store_ref(&self) -> StoreRef {
        self.store.clone()
    }

    /// Add or replace a resource.
    pub async fn add_resource(&self, ideal_state: &IdealState) -> Result<()> {
        let path = self.paths.ideal_state(&ideal_state.resource_name);
        store::write_model(self.store.as_ref(), &path, ideal_state, Expected::Any, NodeMode::Persistent).await?;
        Ok(())
    }

    /// Start a node running mock models of every builtin state model.
    pub async fn start_node(&mut self, name: &str) -> Result<Participant> {
        let factories = vec![
            MockFactory::new(StateModelDefinition::master_slave(), MockBehavior::new())?,
            MockFactory::new(StateModelDefinition::online_offline(), MockBehavior::new())?,
        ];
        self.start_node_with(InstanceConfig::new(name), factories).await
    }

    /// Start a node with the given config and factories.
    pub async fn start_node_with(&mut self, config: InstanceConfig, factories: Vec<MockFactory>) -> Result<Participant> {
        if self.participants.contains_key(&config.instance_name) {
            bail!("node {} is already running", config.instance_name);
        }
        let engine = StateMachineEngine::new(config.instance_name.clone());
        for factory in factories {
            let name = factory.definition().name().to_string();
            engine.register_factory(name, factory)?;
        }
        let participant = Participant::new(self.store_ref(), self.paths.clone(), engine);
        participant.join(config).await?;
        self.transport.register(participant.clone());
        self.participants.insert(participant.name().to_string(), participant.clone());
        Ok(participant)
    }

    /// Stop a running node.
    pub async fn stop_node(&mut self, name: &str) -> Result<()> {
        let participant = self.participants.remove(name).with_context(|| format!("node {} is not running", name))?;
        self.transport.deregister(name);
        participant.leave().await
    }

    /// The running participant of the given node.
    pub fn participant(&self, name: &str) -> Option<&Participant> {
        self.participants.get(name)
    }

    /// Run rebalance passes until a pass sends no messages.
    pub async fn rebalance_until_stable(&self) -> Result<RebalanceReport> {
        for _ in 0..MAX_REBALANCE_PASSES {
            let report = self.controller.rebalance().await?;
            if report.messages_sent() == 0 {
                return Ok(report);
            }
        }
        bail!("cluster did not stabilize within {} rebalance passes", MAX_REBALANCE_PASSES)
    }

    /// A verifier of this cluster.
    pub fn verifier(&self, strategy: Verifier) -> ClusterVerifier {
        ClusterVerifier::new(self.store_ref(), self.paths.clone(), statemodel::builtin_definitions(), strategy)
    }
}
