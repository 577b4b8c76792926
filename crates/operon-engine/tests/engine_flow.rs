mod common;

use std::sync::Arc;

use common::ScriptedExecutor;
use operon_core::evidence::{EvidenceKind, RecordingSink};
use operon_core::state::ExecutionState;
use operon_core::types::{Composition, Operator, OperatorKind, Primitive, Stratum};
use operon_core::EngineConfig;
use operon_engine::{Engine, ExecutionPhase, FailureClass, RunStatus};
use operon_interpreters::control::SequenceInterpreter;
use operon_interpreters::InterpreterRegistry;

fn primitives(ids: &[&str]) -> Vec<Primitive> {
    ids.iter().map(|id| Primitive::new(*id, *id)).collect()
}

#[tokio::test]
async fn test_sequence_dispatches_in_declared_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "seq-order",
        primitives(&["p1", "p2", "p3"]),
        vec![Operator::new("steps", OperatorKind::Sequence).with_inputs(vec!["p1", "p2", "p3"])],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.phase, ExecutionPhase::Completed);
    assert_eq!(executor.dispatch_order(), vec!["p1", "p2", "p3"]);
    assert_eq!(report.final_state.get_bool("p2_done"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_merge_ignores_completion_order() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_delay("p1", 50)
            .with_delay("p2", 5)
            .with_delay("p3", 1),
    );
    executor.succeed_with("p1", serde_json::json!({"shared": "from_p1", "a": 1}));
    executor.succeed_with("p2", serde_json::json!({"shared": "from_p2", "b": 2}));
    executor.succeed_with("p3", serde_json::json!({"shared": "from_p3", "c": 3}));

    let composition = Composition::new(
        "fanout",
        primitives(&["p1", "p2", "p3"]),
        vec![Operator::new("fan", OperatorKind::Parallel).with_inputs(vec!["p1", "p2", "p3"])],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    // Declaration order decides the merge winner, not completion order.
    assert_eq!(report.final_state.get_str("shared"), Some("from_p3"));
    assert_eq!(report.final_state.get_u64("a"), Some(1));
    assert_eq!(report.final_state.get_u64("b"), Some(2));
}

#[tokio::test]
async fn test_conditional_branch_skips_untaken_path() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "routing",
        primitives(&["p_low", "p_high"]),
        vec![
            Operator::new("route", OperatorKind::Conditional)
                .with_conditions(vec!["confidence >= 0.8 => deep"])
                .with_parameters(serde_json::json!({"default_target": "shallow"})),
            Operator::new("shallow", OperatorKind::Sequence).with_inputs(vec!["p_low"]),
            Operator::new("deep", OperatorKind::Sequence).with_inputs(vec!["p_high"]),
        ],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let mut state = ExecutionState::new();
    state.set("confidence", serde_json::json!(0.95));
    let report = engine.execute_with_state(&composition, state).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(executor.dispatch_count("p_low"), 0);
    assert_eq!(executor.dispatch_count("p_high"), 1);
    assert_eq!(report.nodes[0].disposition, "branch");
}

#[tokio::test]
async fn test_unresolvable_branch_target_fails_with_report() {
    let executor = Arc::new(ScriptedExecutor::new());
    // Built from serialized form, sidestepping constructor validation the
    // way a hand-edited plan file could.
    let composition: Composition = serde_json::from_value(serde_json::json!({
        "id": "bad-routing",
        "primitives": [{"id": "p1", "name": "p1"}],
        "operators": [{
            "id": "route",
            "kind": "conditional",
            "parameters": {"default_target": "nowhere"},
        }],
    }))
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.phase, ExecutionPhase::Failed);
    assert_eq!(executor.total_dispatches(), 0);
    assert_eq!(report.nodes[0].disposition, "terminate");
    let reason = report.reason.unwrap();
    assert_eq!(reason.classification, FailureClass::Fatal);
    assert!(reason.detail.contains("nowhere"));
}

#[tokio::test]
async fn test_loop_iterates_until_verification_passes() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.succeed_with("check", serde_json::json!({"verification_passed": false}));
    executor.succeed_with("check", serde_json::json!({"verification_passed": true}));

    let composition = Composition::new(
        "refine",
        primitives(&["check"]),
        vec![Operator::new("iterate", OperatorKind::Loop)
            .with_inputs(vec!["check"])
            .with_conditions(vec!["verification_passed"])
            .with_parameters(serde_json::json!({"max_iterations": 5}))],
    )
    .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let engine = Engine::new(executor.clone()).with_evidence_sink(sink.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(executor.dispatch_count("check"), 2);
    assert_eq!(report.final_state.get_bool("loop_completed"), Some(true));

    let iterations: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == EvidenceKind::LoopIteration)
        .collect();
    assert_eq!(iterations.len(), 2);
    assert_eq!(iterations[1].payload["iteration"], serde_json::json!(2));
}

#[tokio::test]
async fn test_loop_terminates_at_iteration_cap() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "stuck",
        primitives(&["check"]),
        vec![Operator::new("iterate", OperatorKind::Loop)
            .with_inputs(vec!["check"])
            .with_conditions(vec!["verification_passed"])
            .with_parameters(serde_json::json!({"max_iterations": 3}))],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.phase, ExecutionPhase::Terminated);
    assert_eq!(executor.dispatch_count("check"), 3);
    let reason = report.reason.unwrap();
    assert_eq!(reason.classification, FailureClass::GracefulTermination);
}

#[tokio::test(start_paused = true)]
async fn test_retry_backs_off_then_terminates() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail("flaky", 3);

    let composition = Composition::new(
        "retrying",
        primitives(&["flaky"]),
        vec![Operator::new("retry_op", OperatorKind::Retry)
            .with_inputs(vec!["flaky"])
            .with_parameters(serde_json::json!({"max_retries": 2, "base_delay_ms": 1000}))],
    )
    .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let engine = Engine::new(executor.clone()).with_evidence_sink(sink.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.phase, ExecutionPhase::Terminated);
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(executor.dispatch_count("flaky"), 3);

    let delays: Vec<u64> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == EvidenceKind::RetryScheduled)
        .map(|e| e.payload["delay_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(delays, vec![1000, 2000]);
}

#[tokio::test]
async fn test_circuit_breaker_skips_across_runs() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail("fragile", 1);

    let composition = Composition::new(
        "guarded",
        primitives(&["fragile"]),
        vec![Operator::new("guard", OperatorKind::CircuitBreaker)
            .with_inputs(vec!["fragile"])
            .with_parameters(
                serde_json::json!({"failure_threshold": 1, "reset_timeout_ms": 60000}),
            )],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());

    // First run fails the step and opens the circuit.
    let first = engine.execute(&composition).await.unwrap();
    assert_eq!(first.status, RunStatus::Partial);
    assert_eq!(executor.dispatch_count("fragile"), 1);

    // Second run is vetoed without dispatching; breaker state survived.
    let second = engine.execute(&composition).await.unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.nodes[0].disposition, "skip");
    assert_eq!(executor.dispatch_count("fragile"), 1);
}

#[tokio::test]
async fn test_fallback_uses_backup_path() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail("primary", 1);
    executor.succeed_with("backup", serde_json::json!({"answer": 42}));

    let composition = Composition::new(
        "degraded",
        primitives(&["primary", "backup"]),
        vec![Operator::new("fb", OperatorKind::Fallback).with_inputs(vec!["primary", "backup"])],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.phase, ExecutionPhase::Completed);
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.final_state.get_u64("answer"), Some(42));
    assert_eq!(report.nodes[0].disposition, "skip");
    assert_eq!(report.nodes[0].failed_primitives, 1);
}

#[tokio::test]
async fn test_quorum_reaches_majority() {
    let executor = Arc::new(ScriptedExecutor::new());
    for (id, verdict) in [
        ("a", "safe"),
        ("b", "safe"),
        ("c", "unsafe"),
        ("d", "safe"),
        ("e", "unsafe"),
    ] {
        executor.succeed_with(id, serde_json::json!({"conclusion": verdict}));
    }

    let composition = Composition::new(
        "reviewers",
        primitives(&["a", "b", "c", "d", "e"]),
        vec![Operator::new("vote", OperatorKind::Quorum)
            .with_inputs(vec!["a", "b", "c", "d", "e"])],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.final_state.get_str("conclusion"), Some("safe"));
    assert_eq!(report.final_state.get_bool("quorum_reached"), Some(true));
}

#[tokio::test]
async fn test_quorum_shortfall_escalates() {
    let executor = Arc::new(ScriptedExecutor::new());
    for (id, verdict) in [
        ("a", "safe"),
        ("b", "safe"),
        ("c", "safe"),
        ("d", "unsafe"),
        ("e", "unsafe"),
    ] {
        executor.succeed_with(id, serde_json::json!({"conclusion": verdict}));
    }

    let composition = Composition::new(
        "strict-reviewers",
        primitives(&["a", "b", "c", "d", "e"]),
        vec![Operator::new("vote", OperatorKind::Quorum)
            .with_inputs(vec!["a", "b", "c", "d", "e"])
            .with_parameters(serde_json::json!({"required": 4}))],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.phase, ExecutionPhase::Escalated);
    assert_eq!(report.status, RunStatus::Partial);
    let escalation = report.escalation.unwrap();
    assert_eq!(escalation.context["votes"], serde_json::json!(3));
    assert_eq!(escalation.context["required"], serde_json::json!(4));
    assert_eq!(
        report.reason.unwrap().classification,
        FailureClass::Escalation
    );
}

#[tokio::test]
async fn test_budget_cap_terminates_over_spend() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.succeed_with_tokens("p1", 600);
    executor.succeed_with_tokens("p2", 600);

    let composition = Composition::new(
        "costly",
        primitives(&["p1", "p2"]),
        vec![Operator::new("cap", OperatorKind::BudgetCap)
            .with_inputs(vec!["p1", "p2"])
            .with_parameters(serde_json::json!({"max_tokens": 1000}))],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.phase, ExecutionPhase::Terminated);
    assert_eq!(report.tokens_used, 1200);
    assert_eq!(executor.dispatch_count("p1"), 1);
    assert_eq!(executor.dispatch_count("p2"), 1);
    assert!(report.reason.unwrap().detail.contains("Budget exceeded"));
}

#[tokio::test]
async fn test_timebox_terminates_past_deadline() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "slow",
        primitives(&["p1", "p2"]),
        vec![Operator::new("tb", OperatorKind::Timebox)
            .with_inputs(vec!["p1", "p2"])
            .with_parameters(serde_json::json!({"max_duration_ms": 0}))],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.phase, ExecutionPhase::Terminated);
    assert_eq!(report.status, RunStatus::Partial);
    // The running step finishes; the overrun is caught at the boundary.
    assert_eq!(executor.dispatch_count("p1"), 1);
    assert_eq!(executor.dispatch_count("p2"), 0);
}

#[tokio::test]
async fn test_unsupported_operator_refuses_before_dispatch() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "partial-registry",
        primitives(&["p1", "a", "b", "c"]),
        vec![
            Operator::new("steps", OperatorKind::Sequence).with_inputs(vec!["p1"]),
            Operator::new("vote", OperatorKind::Quorum).with_inputs(vec!["a", "b", "c"]),
        ],
    )
    .unwrap();

    let mut registry = InterpreterRegistry::new();
    registry.register(Arc::new(SequenceInterpreter));
    let engine = Engine::new(executor.clone()).with_registry(registry);
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.phase, ExecutionPhase::Failed);
    assert_eq!(executor.total_dispatches(), 0);
    assert!(report.nodes.is_empty());
    let reason = report.reason.unwrap();
    assert_eq!(reason.classification, FailureClass::Fatal);
    assert!(reason.detail.contains("operator_unsupported: quorum"));
}

#[tokio::test]
async fn test_evidence_emitted_in_lifecycle_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "traced",
        primitives(&["p1", "p2"]),
        vec![Operator::new("steps", OperatorKind::Sequence).with_inputs(vec!["p1", "p2"])],
    )
    .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let engine = Engine::new(executor.clone()).with_evidence_sink(sink.clone());
    let report = engine.execute(&composition).await.unwrap();

    let events = sink.events();
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EvidenceKind::OperatorStart,
            EvidenceKind::PrimitiveDispatch,
            EvidenceKind::PrimitiveDispatch,
            EvidenceKind::OperatorResult,
        ]
    );
    assert_eq!(events[1].payload["primitive_id"], serde_json::json!("p1"));
    assert_eq!(events[2].payload["primitive_id"], serde_json::json!("p2"));

    // The report's ledger matches emission order.
    let ids: Vec<_> = events.iter().map(|e| e.id.clone()).collect();
    assert_eq!(report.evidence, ids);
}

#[tokio::test]
async fn test_unapproved_stratum_escalates_before_dispatch() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "open-ended",
        primitives(&["p1"]),
        vec![Operator::new("steps", OperatorKind::Sequence).with_inputs(vec!["p1"])],
    )
    .unwrap();

    let config = EngineConfig {
        stratum: Some(Stratum::Unrestricted),
        ..EngineConfig::default()
    };
    let engine = Engine::new(executor.clone()).with_config(config);
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.phase, ExecutionPhase::Escalated);
    assert_eq!(executor.total_dispatches(), 0);
    assert_eq!(
        report.escalation.unwrap().context["reason"],
        serde_json::json!("approval_required")
    );

    // The same run goes through once approved.
    let config = EngineConfig {
        stratum: Some(Stratum::Unrestricted),
        approved: true,
        ..EngineConfig::default()
    };
    let engine = Engine::new(executor.clone()).with_config(config);
    let report = engine.execute(&composition).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(executor.dispatch_count("p1"), 1);
}

#[tokio::test]
async fn test_cancelled_run_fails_without_dispatch() {
    let executor = Arc::new(ScriptedExecutor::new());
    let composition = Composition::new(
        "cancelled",
        primitives(&["p1"]),
        vec![Operator::new("steps", OperatorKind::Sequence).with_inputs(vec!["p1"])],
    )
    .unwrap();

    let engine = Engine::new(executor.clone());
    engine.cancellation_token().cancel();
    let report = engine.execute(&composition).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.phase, ExecutionPhase::Failed);
    assert_eq!(executor.total_dispatches(), 0);
    assert!(report.reason.unwrap().detail.contains("cancelled"));
}
