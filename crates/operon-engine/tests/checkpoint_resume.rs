mod common;

use std::sync::Arc;

use common::ScriptedExecutor;
use operon_core::evidence::{EvidenceKind, RecordingSink};
use operon_core::state::ExecutionState;
use operon_core::types::{
    Composition, ExecutionId, Operator, OperatorKind, Primitive, Stratum, StratumPolicy,
};
use operon_core::{EngineConfig, OperonError};
use operon_engine::{
    CheckpointStore, Engine, ExecutionPhase, ExecutionSnapshot, FailureClass,
    FixedStratumPolicies, RunStatus,
};

fn primitives(ids: &[&str]) -> Vec<Primitive> {
    ids.iter().map(|id| Primitive::new(*id, *id)).collect()
}

#[tokio::test]
async fn test_timebox_checkpoint_suspends_and_persists() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "suspendable",
        primitives(&["p1", "p2"]),
        vec![Operator::new("tb", OperatorKind::Timebox)
            .with_inputs(vec!["p1", "p2"])
            .with_parameters(
                serde_json::json!({"max_duration_ms": 0, "on_timeout": "checkpoint"}),
            )],
    )
    .unwrap();

    let store = Arc::new(CheckpointStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::new());
    let engine = Engine::new(executor.clone())
        .with_checkpoint_store(store.clone())
        .with_evidence_sink(sink.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.phase, ExecutionPhase::Checkpointed);
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(
        report.reason.as_ref().unwrap().classification,
        FailureClass::Suspension
    );
    assert_eq!(executor.dispatch_count("p1"), 1);
    assert_eq!(executor.dispatch_count("p2"), 0);

    let snapshot = store.load(&report.execution_id).unwrap().unwrap();
    assert_eq!(snapshot.node_index, 0);
    assert!(sink
        .events()
        .iter()
        .any(|e| e.kind == EvidenceKind::CheckpointCreated));
}

#[tokio::test]
async fn test_resume_continues_from_snapshot() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "resumable",
        primitives(&["p0", "p1"]),
        vec![
            Operator::new("first", OperatorKind::Sequence).with_inputs(vec!["p0"]),
            Operator::new("second", OperatorKind::Sequence).with_inputs(vec!["p1"]),
        ],
    )
    .unwrap();

    let store = Arc::new(CheckpointStore::in_memory().unwrap());
    let mut suspended = ExecutionState::new();
    suspended.set_str("carried", "yes");
    store
        .save(
            &ExecutionSnapshot::new(
                ExecutionId::from_raw("x-resume"),
                composition.id().clone(),
                1,
                &suspended,
                800,
            )
            .unwrap(),
        )
        .unwrap();

    let engine = Engine::new(executor.clone()).with_checkpoint_store(store.clone());
    let report = engine.resume(&composition).await.unwrap();

    assert_eq!(report.execution_id, ExecutionId::from_raw("x-resume"));
    assert_eq!(report.status, RunStatus::Success);
    // The node before the snapshot is not re-executed.
    assert_eq!(executor.dispatch_count("p0"), 0);
    assert_eq!(executor.dispatch_count("p1"), 1);
    assert_eq!(report.final_state.get_str("carried"), Some("yes"));
    // Token spend carries over from the suspended run.
    assert_eq!(report.tokens_used, 800);
}

#[tokio::test]
async fn test_interval_snapshots_during_run() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "long-haul",
        primitives(&["p0", "p1"]),
        vec![
            Operator::new("first", OperatorKind::Sequence).with_inputs(vec!["p0"]),
            Operator::new("second", OperatorKind::Sequence).with_inputs(vec!["p1"]),
        ],
    )
    .unwrap();

    let store = Arc::new(CheckpointStore::in_memory().unwrap());
    let policies = FixedStratumPolicies::new().with_policy(
        Stratum::Productive,
        StratumPolicy {
            checkpoint_interval: Some(1),
            ..StratumPolicy::default()
        },
    );
    let config = EngineConfig {
        stratum: Some(Stratum::Productive),
        ..EngineConfig::default()
    };
    let engine = Engine::new(executor.clone())
        .with_config(config)
        .with_policies(Arc::new(policies))
        .with_checkpoint_store(store.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    // A snapshot lands after each completed node; the last one points past
    // the final node.
    let snapshot = store.load(&report.execution_id).unwrap().unwrap();
    assert_eq!(snapshot.node_index, 2);
}

#[tokio::test]
async fn test_resume_without_snapshot_is_an_error() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "fresh",
        primitives(&["p0"]),
        vec![Operator::new("first", OperatorKind::Sequence).with_inputs(vec!["p0"])],
    )
    .unwrap();

    let store = Arc::new(CheckpointStore::in_memory().unwrap());
    let engine = Engine::new(executor.clone()).with_checkpoint_store(store);
    let result = engine.resume(&composition).await;
    assert!(matches!(result, Err(OperonError::Checkpoint(_))));
    assert_eq!(executor.total_dispatches(), 0);
}

#[tokio::test]
async fn test_resume_requires_a_store() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "no-store",
        primitives(&["p0"]),
        vec![Operator::new("first", OperatorKind::Sequence).with_inputs(vec!["p0"])],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    assert!(matches!(
        engine.resume(&composition).await,
        Err(OperonError::Checkpoint(_))
    ));
}
