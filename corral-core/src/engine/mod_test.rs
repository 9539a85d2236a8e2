use std::time::Duration;

use anyhow::{Context, Result};

use crate::engine::{Ack, StateMachineEngine, TransitionError, TransitionMessage};
use crate::error::AppError;
use crate::fixtures::{MockBehavior, MockFactory};
use crate::statemodel::{StateModelDefinition, MASTER_SLAVE, STATE_DROPPED, STATE_ERROR, STATE_MASTER, STATE_OFFLINE, STATE_SLAVE};

const NODE: &str = "node-0";
const DB: &str = "db";

fn engine_with(behavior: MockBehavior) -> Result<StateMachineEngine> {
    let engine = StateMachineEngine::new(NODE);
    engine.register_factory(MASTER_SLAVE, MockFactory::new(StateModelDefinition::master_slave(), behavior)?)?;
    Ok(engine)
}

fn msg(partition: &str, from: &str, to: &str) -> TransitionMessage {
    TransitionMessage::new(DB, partition, from, to, NODE, MASTER_SLAVE)
}

/// Drive the given partition from the initial state to the target state along legal edges.
async fn drive_to(engine: &StateMachineEngine, partition: &str, target: &str) -> Result<()> {
    let def = StateModelDefinition::master_slave();
    let mut current = def.initial_state().to_string();
    while current != target {
        let next = def.next_hop(&current, target).context("no path to target state")?;
        engine.on_transition_message(&msg(partition, &current, &next)).await?;
        current = next;
    }
    Ok(())
}

fn transition_err(err: anyhow::Error) -> Result<TransitionError> {
    err.downcast::<TransitionError>().context("unexpected error type")
}

#[tokio::test]
async fn every_legal_edge_updates_state() -> Result<()> {
    let engine = engine_with(MockBehavior::new())?;
    let def = StateModelDefinition::master_slave();

    for (idx, (from, to)) in def.edges().into_iter().enumerate() {
        if from == def.error_state() {
            continue;
        }
        let partition = format!("{}_{}", DB, idx);
        drive_to(&engine, &partition, &from).await?;

        let state = engine.on_transition_message(&msg(&partition, &from, &to)).await?;

        assert_eq!(state, to, "expected transition {} -> {} to land in {}", from, to, to);
        if to == def.dropped_state() {
            assert!(engine.current_state(DB, &partition).is_none(), "expected dropped instance to be removed");
        } else {
            assert_eq!(engine.current_state(DB, &partition).as_deref(), Some(to.as_str()), "unexpected recorded state");
        }
    }
    Ok(())
}

#[tokio::test]
async fn every_non_edge_is_rejected_with_state_unchanged() -> Result<()> {
    let engine = engine_with(MockBehavior::new())?;
    let def = StateModelDefinition::master_slave();

    for (idx, from) in [STATE_OFFLINE, STATE_SLAVE, STATE_MASTER].iter().enumerate() {
        let partition = format!("{}_{}", DB, idx);
        drive_to(&engine, &partition, from).await?;
        for to in def.states().iter().filter(|to| !def.is_edge(from, to)) {
            let err = engine
                .on_transition_message(&msg(&partition, from, to))
                .await
                .err()
                .context("expected non-edge to be rejected")?;

            let err = transition_err(err)?;
            assert!(matches!(err, TransitionError::InvalidTransition { .. }), "unexpected error for {} -> {}: {:?}", from, to, err);
            assert_eq!(engine.current_state(DB, &partition).as_deref(), Some(*from), "expected state to be unchanged after {} -> {}", from, to);
        }
    }
    Ok(())
}

#[tokio::test]
async fn stale_message_is_rejected() -> Result<()> {
    let engine = engine_with(MockBehavior::new())?;
    drive_to(&engine, "db_0", STATE_SLAVE).await?;

    let err = engine
        .on_transition_message(&msg("db_0", STATE_OFFLINE, STATE_SLAVE))
        .await
        .err()
        .context("expected stale message to be rejected")?;

    let err = transition_err(err)?;
    assert!(matches!(err, TransitionError::InvalidTransition { ref from, .. } if from == STATE_SLAVE), "unexpected error {:?}", err);
    Ok(())
}

#[tokio::test]
async fn application_error_moves_instance_to_error_and_is_contained() -> Result<()> {
    let engine = StateMachineEngine::new(NODE);
    let factory = MockFactory::failing_master_slave()?;
    let behavior = factory.behavior();
    engine.register_factory(MASTER_SLAVE, factory)?;

    let res = engine.on_transition_message(&msg("db_0", STATE_OFFLINE, STATE_SLAVE)).await;
    assert_eq!(Ack::from_result(&res), Ack::Error, "expected an error ack");
    let err = transition_err(res.err().context("expected transition to fail")?)?;
    assert!(matches!(err, TransitionError::ApplicationTransition { .. }), "unexpected error {:?}", err);
    assert_eq!(engine.current_state(DB, "db_0").as_deref(), Some(STATE_ERROR), "expected instance to be in error");

    // Other instances keep transitioning.
    engine.on_transition_message(&msg("db_1", STATE_OFFLINE, STATE_DROPPED)).await?;
    assert_eq!(behavior.journal().len(), 1, "expected one completed transition, got {:?}", behavior.journal());
    assert_eq!(engine.error_instances(), vec![(DB.to_string(), "db_0".to_string())], "unexpected error instances");

    // An error instance may still be dropped.
    engine.on_transition_message(&msg("db_0", STATE_ERROR, STATE_DROPPED)).await?;
    assert!(engine.error_instances().is_empty(), "expected no error instances after drop");
    Ok(())
}

#[tokio::test]
async fn reset_moves_error_instance_to_initial_state() -> Result<()> {
    let engine = StateMachineEngine::new(NODE);
    engine.register_factory(MASTER_SLAVE, MockFactory::failing_master_slave()?)?;
    let _ = engine.on_transition_message(&msg("db_0", STATE_OFFLINE, STATE_SLAVE)).await;

    engine.reset(DB, "db_0").await?;

    assert_eq!(engine.current_state(DB, "db_0").as_deref(), Some(STATE_OFFLINE), "expected instance to be reset");
    let err = engine.reset(DB, "db_0").await.err().context("expected reset of a healthy instance to fail")?;
    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::Precondition(_)), "unexpected error {:?}", app_err);
    Ok(())
}

#[tokio::test]
async fn dropped_instance_rejects_further_messages() -> Result<()> {
    let engine = engine_with(MockBehavior::new())?;
    drive_to(&engine, "db_0", STATE_DROPPED).await?;

    let err = engine
        .on_transition_message(&msg("db_0", STATE_SLAVE, STATE_MASTER))
        .await
        .err()
        .context("expected message for dropped instance to be rejected")?;
    let err = transition_err(err)?;
    assert!(matches!(err, TransitionError::UnknownInstance { .. }), "unexpected error {:?}", err);

    // A fresh assignment recreates the instance.
    let state = engine.on_transition_message(&msg("db_0", STATE_OFFLINE, STATE_SLAVE)).await?;
    assert_eq!(state, STATE_SLAVE, "expected recreated instance to transition");
    Ok(())
}

#[tokio::test]
async fn rejected_message_for_unknown_instance_publishes_no_state() -> Result<()> {
    let engine = engine_with(MockBehavior::new())?;

    let err = engine
        .on_transition_message(&msg("db_0", STATE_SLAVE, STATE_MASTER))
        .await
        .err()
        .context("expected message from a non-initial state to be rejected")?;
    let err = transition_err(err)?;
    assert!(matches!(err, TransitionError::InvalidTransition { .. }), "unexpected error {:?}", err);
    let err = engine
        .on_transition_message(&msg("db_0", STATE_OFFLINE, STATE_MASTER))
        .await
        .err()
        .context("expected non-edge from the initial state to be rejected")?;
    let err = transition_err(err)?;
    assert!(matches!(err, TransitionError::InvalidTransition { .. }), "unexpected error {:?}", err);
    let states = engine.current_states(DB);
    assert!(states.is_empty(), "expected no published state for rejected messages, got {:?}", states);

    drive_to(&engine, "db_1", STATE_DROPPED).await?;
    let err = engine
        .on_transition_message(&msg("db_1", STATE_OFFLINE, STATE_MASTER))
        .await
        .err()
        .context("expected non-edge for a dropped instance to be rejected")?;
    let err = transition_err(err)?;
    assert!(matches!(err, TransitionError::InvalidTransition { .. }), "unexpected error {:?}", err);
    let states = engine.current_states(DB);
    assert!(states.is_empty(), "expected dropped instance to stay unpublished, got {:?}", states);
    Ok(())
}

#[tokio::test]
async fn messages_are_validated_against_node_and_model() -> Result<()> {
    let engine = engine_with(MockBehavior::new())?;

    let mut wrong_node = msg("db_0", STATE_OFFLINE, STATE_SLAVE);
    wrong_node.target_node = "node-1".into();
    let err = transition_err(engine.on_transition_message(&wrong_node).await.err().context("expected error")?)?;
    assert!(matches!(err, TransitionError::WrongNode { .. }), "unexpected error {:?}", err);

    let mut unknown_model = msg("db_0", STATE_OFFLINE, STATE_SLAVE);
    unknown_model.state_model = "LeaderStandby".into();
    let err = transition_err(engine.on_transition_message(&unknown_model).await.err().context("expected error")?)?;
    assert!(matches!(err, TransitionError::UnknownStateModel(_)), "unexpected error {:?}", err);

    let err = engine
        .register_factory(MASTER_SLAVE, MockFactory::new(StateModelDefinition::master_slave(), MockBehavior::new())?)
        .err()
        .context("expected duplicate registration to fail")?;
    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::InvalidArgument(_)), "unexpected error {:?}", app_err);
    Ok(())
}

#[tokio::test]
async fn interrupt_rolls_back_in_flight_transition() -> Result<()> {
    let behavior = MockBehavior::new().block_on(STATE_OFFLINE, STATE_SLAVE);
    let engine = engine_with(behavior)?;

    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.on_transition_message(&msg("db_0", STATE_OFFLINE, STATE_SLAVE)).await }
    });
    let mut interrupted = false;
    for _ in 0..100 {
        if engine.interrupt(DB, "db_0") {
            interrupted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(interrupted, "expected an in-flight transition to interrupt");
    let res = tokio::time::timeout(Duration::from_secs(5), handle).await.context("timeout waiting for rollback")??;

    assert_eq!(Ack::from_result(&res), Ack::Retry, "expected a retry ack");
    let err = transition_err(res.err().context("expected a rollback")?)?;
    assert!(matches!(err, TransitionError::Rollback { .. }), "unexpected error {:?}", err);
    assert_eq!(engine.current_state(DB, "db_0").as_deref(), Some(STATE_OFFLINE), "expected state to be unchanged");
    Ok(())
}

#[tokio::test]
async fn distinct_instances_run_concurrently_same_instance_serially() -> Result<()> {
    let factory = MockFactory::new(StateModelDefinition::master_slave(), MockBehavior::new().with_delay(Duration::from_millis(100)))?;
    let behavior = factory.behavior();
    let engine = StateMachineEngine::new(NODE);
    engine.register_factory(MASTER_SLAVE, factory)?;

    let handles: Vec<_> = (0..4)
        .map(|idx| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.on_transition_message(&msg(&format!("db_{}", idx), STATE_OFFLINE, STATE_SLAVE)).await })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }
    assert!(behavior.max_running() > 1, "expected distinct instances to overlap, max running {}", behavior.max_running());

    let factory = MockFactory::new(StateModelDefinition::master_slave(), MockBehavior::new().with_delay(Duration::from_millis(50)))?;
    let behavior = factory.behavior();
    let engine = StateMachineEngine::new(NODE);
    engine.register_factory(MASTER_SLAVE, factory)?;
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.on_transition_message(&msg("db_0", STATE_OFFLINE, STATE_SLAVE)).await })
        })
        .collect();
    let mut completed = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            completed += 1;
        }
    }
    assert_eq!(behavior.max_running(), 1, "expected transitions of one instance to be serialized");
    assert_eq!(completed, 1, "expected exactly one of the duplicate messages to apply, got {}", completed);
    Ok(())
}
