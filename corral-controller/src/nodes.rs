//! Nodes hosted inside the controller process.
//!
//! Local nodes run the builtin state models with handlers which only record and log each
//! transition. They receive messages through the in-process transport, which makes a single
//! controller process a complete, self contained cluster.

use anyhow::{Context, Result};

use corral_core::engine::{StateMachineEngine, TransitionMessage};
use corral_core::models::InstanceConfig;
use corral_core::participant::{LocalTransport, Participant};
use corral_core::paths::PathBuilder;
use corral_core::statemodel::{StateModelDefinition, StateModelFactory, TransitionFuture, TransitionTable};
use corral_core::store::StoreRef;

/// A replica hosted by a local node.
pub struct LocalReplica {
    resource: String,
    partition: String,
    /// The number of transitions applied to this replica.
    transitions: u64,
}

/// A factory of local replicas for one state model.
pub struct LocalReplicaFactory {
    definition: StateModelDefinition,
    table: TransitionTable<LocalReplica>,
}

impl LocalReplicaFactory {
    /// Create a factory binding every edge of the given definition.
    pub fn new(definition: StateModelDefinition) -> Result<Self> {
        let mut builder = TransitionTable::<LocalReplica>::builder(&definition);
        for (from, to) in definition.edges() {
            builder = builder.on(&from, &to, apply_transition);
        }
        let table = builder.build()?;
        Ok(Self { definition, table })
    }
}

impl StateModelFactory for LocalReplicaFactory {
    type Model = LocalReplica;

    fn definition(&self) -> &StateModelDefinition {
        &self.definition
    }

    fn transitions(&self) -> &TransitionTable<LocalReplica> {
        &self.table
    }

    fn create_model(&self, resource: &str, partition: &str) -> LocalReplica {
        LocalReplica {
            resource: resource.into(),
            partition: partition.into(),
            transitions: 0,
        }
    }
}

fn apply_transition<'a>(replica: &'a mut LocalReplica, msg: &'a TransitionMessage) -> TransitionFuture<'a> {
    Box::pin(async move {
        replica.transitions += 1;
        tracing::info!(
            resource = %replica.resource,
            partition = %replica.partition,
            node = %msg.target_node,
            from = %msg.from_state,
            to = %msg.to_state,
            transitions = replica.transitions,
            "replica transitioned"
        );
        Ok(())
    })
}

/// Start the given local nodes, joining each to the cluster and routing its messages through
/// the transport.
pub async fn start_local_nodes(names: &[String], store: StoreRef, paths: PathBuilder, transport: &LocalTransport) -> Result<Vec<Participant>> {
    let mut participants = Vec::with_capacity(names.len());
    for name in names {
        let engine = StateMachineEngine::new(name.clone());
        for definition in [StateModelDefinition::master_slave(), StateModelDefinition::online_offline()] {
            let model = definition.name().to_string();
            engine.register_factory(model, LocalReplicaFactory::new(definition)?)?;
        }
        let participant = Participant::new(store.clone(), paths.clone(), engine);
        participant
            .join(InstanceConfig::new(name.clone()))
            .await
            .with_context(|| format!("error joining local node {} to the cluster", name))?;
        transport.register(participant.clone());
        tracing::info!(node = %name, "local node started");
        participants.push(participant);
    }
    Ok(participants)
}

/// Stop local nodes, recording each as offline.
pub async fn stop_local_nodes(participants: Vec<Participant>, transport: &LocalTransport) {
    for participant in participants {
        transport.deregister(participant.name());
        if let Err(err) = participant.leave().await {
            tracing::error!(error = ?err, node = participant.name(), "error stopping local node");
        }
    }
}
