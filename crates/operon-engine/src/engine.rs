//! The execution engine: walks a composition's operator nodes, dispatches
//! primitives through the external executor, and routes every lifecycle
//! decision through the registered interpreters.
//!
//! The engine owns all externally observable effects. Interpreters only
//! read and write run state and return decisions; waiting, dispatching,
//! evidence emission, and checkpoint persistence happen here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use operon_core::config::EngineConfig;
use operon_core::error::{OperonError, Result};
use operon_core::evidence::{BroadcastSink, Evidence, EvidenceEvent, EvidenceId, EvidenceKind};
use operon_core::state::{ExecutionContext, ExecutionState};
use operon_core::traits::{
    ContractValidator, EvidenceSink, OperatorInterpreter, PrimitiveExecutor, StratumPolicyLookup,
};
use operon_core::types::{
    Composition, CompositionId, EscalationLevel, ExecutionId, Operator, OperatorDecision,
    OperatorId, OperatorKind, Primitive, PrimitiveOutcome, StratumPolicy,
};
use operon_interpreters::control::LoopInterpreter;
use operon_interpreters::InterpreterRegistry;

use crate::breaker::InMemoryBreakerStore;
use crate::checkpoint::{CheckpointStore, ExecutionSnapshot};
use crate::report::{
    EscalationRecord, ExecutionPhase, FailureClass, NodeRecord, ReasonChain, RunReport, RunStatus,
};
use crate::stratum::FixedStratumPolicies;

/// How a node entry resolved the whole run, when it did.
enum RunEnd {
    Terminated { reason: String, graceful: bool },
    Escalated {
        level: EscalationLevel,
        context: serde_json::Value,
    },
    Checkpointed {
        reason: String,
        state: ExecutionState,
    },
    Cancelled,
    Fatal { detail: String },
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<InterpreterRegistry>,
    executor: Arc<dyn PrimitiveExecutor>,
    validator: Option<Arc<dyn ContractValidator>>,
    sink: Arc<dyn EvidenceSink>,
    policies: Arc<dyn StratumPolicyLookup>,
    checkpoints: Option<Arc<CheckpointStore>>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(executor: Arc<dyn PrimitiveExecutor>) -> Self {
        Self {
            config: EngineConfig::default(),
            registry: Arc::new(InterpreterRegistry::with_defaults(Arc::new(
                InMemoryBreakerStore::new(),
            ))),
            executor,
            validator: None,
            sink: Arc::new(BroadcastSink::default()),
            policies: Arc::new(FixedStratumPolicies::new()),
            checkpoints: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Apply configuration. Resets the evidence sink to a broadcast sink
    /// sized by the config, so call this before `with_evidence_sink`.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.sink = Arc::new(BroadcastSink::new(config.evidence_capacity));
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: InterpreterRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ContractValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_evidence_sink(mut self, sink: Arc<dyn EvidenceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_policies(mut self, policies: Arc<dyn StratumPolicyLookup>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Token that cancels a running execution when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a composition from the beginning with empty initial state.
    pub async fn execute(&self, composition: &Composition) -> Result<RunReport> {
        self.execute_with_state(composition, ExecutionState::new())
            .await
    }

    /// Execute a composition with caller-supplied initial state.
    pub async fn execute_with_state(
        &self,
        composition: &Composition,
        state: ExecutionState,
    ) -> Result<RunReport> {
        self.run(composition, state, 0, ExecutionId::new(), 0).await
    }

    /// Resume the most recent suspended run of a composition from its
    /// persisted snapshot.
    pub async fn resume(&self, composition: &Composition) -> Result<RunReport> {
        let store = self.checkpoints.as_ref().ok_or_else(|| {
            OperonError::Checkpoint("No checkpoint store configured".into())
        })?;
        let snapshot = store.load_latest(composition.id())?.ok_or_else(|| {
            OperonError::Checkpoint(format!(
                "No snapshot found for composition '{}'",
                composition.id()
            ))
        })?;

        info!(
            composition_id = %composition.id(),
            execution_id = %snapshot.execution_id,
            node_index = snapshot.node_index,
            "Resuming from snapshot"
        );
        let state = snapshot.state()?;
        self.run(
            composition,
            state,
            snapshot.node_index,
            snapshot.execution_id,
            snapshot.tokens_used,
        )
        .await
    }

    async fn run(
        &self,
        composition: &Composition,
        mut state: ExecutionState,
        start_index: usize,
        execution_id: ExecutionId,
        tokens_carried: u64,
    ) -> Result<RunReport> {
        let mut run = RunTrace {
            execution_id,
            composition_id: composition.id().clone(),
            nodes: vec![],
            evidence: vec![],
            tokens_used: tokens_carried,
            failed_steps: 0,
            last_step_failure: None,
        };

        // Every kind must have an interpreter before anything dispatches.
        for operator in composition.operators() {
            if !self.registry.supports(operator.kind) {
                warn!(
                    composition_id = %run.composition_id,
                    operator_id = %operator.id,
                    kind = %operator.kind,
                    "No interpreter registered, refusing to execute"
                );
                return Ok(run.finish(
                    state,
                    ExecutionPhase::Failed,
                    RunStatus::Failed,
                    Some(ReasonChain::new(
                        Some(operator.id.clone()),
                        FailureClass::Fatal,
                        format!("unverified_by_trace(operator_unsupported: {})", operator.kind),
                    )),
                    None,
                ));
            }
        }

        // Stratum gate: some classes never run without explicit approval.
        let policy = self
            .config
            .stratum
            .map(|s| self.policies.policy_for(s));
        if let Some(p) = &policy {
            if (p.human_approval_required || !p.autonomous_execution) && !self.config.approved {
                info!(
                    composition_id = %run.composition_id,
                    stratum = ?self.config.stratum,
                    "Stratum requires approval, escalating before dispatch"
                );
                return Ok(run.finish(
                    state,
                    ExecutionPhase::Escalated,
                    RunStatus::Partial,
                    Some(ReasonChain::new(
                        None,
                        FailureClass::Escalation,
                        "Stratum policy requires human approval before execution",
                    )),
                    Some(EscalationRecord {
                        level: EscalationLevel::Human,
                        context: serde_json::json!({
                            "reason": "approval_required",
                            "stratum": self.config.stratum,
                        }),
                    }),
                ));
            }
        }

        info!(
            composition_id = %run.composition_id,
            execution_id = %run.execution_id,
            operators = composition.operators().len(),
            "Starting execution"
        );

        let started = Instant::now();
        let mut visits: HashMap<usize, u32> = HashMap::new();
        let mut completed_nodes: u32 = 0;
        let mut idx = start_index;

        'nodes: while idx < composition.operators().len() {
            if self.cancel.is_cancelled() {
                return self.end_run(run, state, RunEnd::Cancelled, None, idx);
            }

            let visit = visits.entry(idx).or_insert(0);
            *visit += 1;
            if *visit > self.config.max_node_visits {
                let operator_id = composition.operators()[idx].id.clone();
                return self.end_run(
                    run,
                    state,
                    RunEnd::Terminated {
                        reason: format!(
                            "Node '{}' entered more than {} times",
                            operator_id, self.config.max_node_visits
                        ),
                        graceful: true,
                    },
                    Some(operator_id),
                    idx,
                );
            }

            let operator = &composition.operators()[idx];
            let interpreter = self.registry.get(operator.kind)?;
            debug!(
                operator_id = %operator.id,
                kind = %operator.kind,
                "Entering node"
            );
            trace_phase(&run, ExecutionPhase::Dispatching);

            run.emit(
                &self.sink,
                EvidenceKind::OperatorStart,
                &operator.id,
                serde_json::json!({"kind": operator.kind}),
            );

            let mut record = NodeRecord {
                operator_id: operator.id.clone(),
                kind: operator.kind,
                disposition: "continue".into(),
                primitives_dispatched: 0,
                failed_primitives: 0,
            };

            // Hook 1: before any primitive dispatches.
            let decision = {
                let mut ctx = ExecutionContext::new(
                    &run.composition_id,
                    &run.execution_id,
                    operator,
                    &mut state,
                );
                interpreter.before_execute(&mut ctx)?
            };
            match decision {
                OperatorDecision::Continue { outputs } => {
                    state.merge_outputs(&outputs);
                    if operator.kind == OperatorKind::Loop {
                        run.emit(
                            &self.sink,
                            EvidenceKind::LoopIteration,
                            &operator.id,
                            serde_json::json!({
                                "iteration": LoopInterpreter::iterations(&state, operator),
                            }),
                        );
                    }
                }
                OperatorDecision::Skip { reason } => {
                    run.emit(
                        &self.sink,
                        EvidenceKind::Skip,
                        &operator.id,
                        serde_json::json!({"reason": reason}),
                    );
                    record.disposition = "skip".into();
                    run.close_node(&self.sink, record);
                    idx += 1;
                    continue 'nodes;
                }
                OperatorDecision::Branch { target } => {
                    let next = match composition.resolve_branch_target(&target) {
                        Ok(next) => next,
                        Err(e) => {
                            record.disposition = "terminate".into();
                            run.close_node(&self.sink, record);
                            return self.end_run(
                                run,
                                state,
                                RunEnd::Fatal {
                                    detail: e.to_string(),
                                },
                                Some(operator.id.clone()),
                                idx,
                            );
                        }
                    };
                    run.emit(
                        &self.sink,
                        EvidenceKind::BranchTaken,
                        &operator.id,
                        serde_json::json!({"target": target}),
                    );
                    record.disposition = "branch".into();
                    run.close_node(&self.sink, record);
                    idx = next;
                    continue 'nodes;
                }
                OperatorDecision::Retry { delay_ms, attempt } => {
                    run.emit(
                        &self.sink,
                        EvidenceKind::RetryScheduled,
                        &operator.id,
                        serde_json::json!({"delay_ms": delay_ms, "attempt": attempt}),
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    continue 'nodes;
                }
                terminal => {
                    record.disposition = terminal.tag().into();
                    let end = Self::decision_to_end(terminal);
                    run.close_node(&self.sink, record);
                    return self.end_run(run, state, end, Some(operator.id.clone()), idx);
                }
            }

            // Hook 2 territory: dispatch primitives and consult the
            // interpreter after each outcome.
            trace_phase(&run, ExecutionPhase::AwaitingPrimitives);
            let step = if operator.kind == OperatorKind::Parallel {
                self.run_parallel_node(
                    composition,
                    operator,
                    interpreter.clone(),
                    &mut state,
                    &mut run,
                    &mut record,
                )
                .await?
            } else {
                self.run_sequential_node(
                    composition,
                    operator,
                    interpreter.clone(),
                    &mut state,
                    &mut run,
                    &mut record,
                )
                .await?
            };

            let outcomes = match step {
                StepFlow::Completed(outcomes) => outcomes,
                StepFlow::Jump(target) => {
                    let next = match composition.resolve_branch_target(&target) {
                        Ok(next) => next,
                        Err(e) => {
                            record.disposition = "terminate".into();
                            run.close_node(&self.sink, record);
                            return self.end_run(
                                run,
                                state,
                                RunEnd::Fatal {
                                    detail: e.to_string(),
                                },
                                Some(operator.id.clone()),
                                idx,
                            );
                        }
                    };
                    run.emit(
                        &self.sink,
                        EvidenceKind::BranchTaken,
                        &operator.id,
                        serde_json::json!({"target": target}),
                    );
                    record.disposition = "branch".into();
                    run.close_node(&self.sink, record);
                    idx = next;
                    continue 'nodes;
                }
                StepFlow::End(end, disposition) => {
                    record.disposition = disposition;
                    run.close_node(&self.sink, record);
                    return self.end_run(run, state, end, Some(operator.id.clone()), idx);
                }
            };

            // Hook 3: aggregate the node's outcomes.
            trace_phase(&run, ExecutionPhase::EvaluatingResult);
            let decision = {
                let mut ctx = ExecutionContext::new(
                    &run.composition_id,
                    &run.execution_id,
                    operator,
                    &mut state,
                );
                interpreter.after_execute(&outcomes, &mut ctx)?
            };
            match decision {
                OperatorDecision::Continue { outputs } => {
                    trace_phase(&run, ExecutionPhase::Continuing);
                    state.merge_outputs(&outputs);
                    run.close_node(&self.sink, record);
                    idx += 1;
                }
                OperatorDecision::Skip { reason } => {
                    trace_phase(&run, ExecutionPhase::Skipping);
                    run.emit(
                        &self.sink,
                        EvidenceKind::Skip,
                        &operator.id,
                        serde_json::json!({"reason": reason}),
                    );
                    record.disposition = "skip".into();
                    run.close_node(&self.sink, record);
                    idx += 1;
                }
                OperatorDecision::Branch { target } => {
                    trace_phase(&run, ExecutionPhase::Branching);
                    let next = match composition.resolve_branch_target(&target) {
                        Ok(next) => next,
                        Err(e) => {
                            record.disposition = "terminate".into();
                            run.close_node(&self.sink, record);
                            return self.end_run(
                                run,
                                state,
                                RunEnd::Fatal {
                                    detail: e.to_string(),
                                },
                                Some(operator.id.clone()),
                                idx,
                            );
                        }
                    };
                    run.emit(
                        &self.sink,
                        EvidenceKind::BranchTaken,
                        &operator.id,
                        serde_json::json!({"target": target}),
                    );
                    record.disposition = "branch".into();
                    run.close_node(&self.sink, record);
                    idx = next;
                }
                OperatorDecision::Retry { delay_ms, attempt } => {
                    trace_phase(&run, ExecutionPhase::Retrying);
                    run.emit(
                        &self.sink,
                        EvidenceKind::RetryScheduled,
                        &operator.id,
                        serde_json::json!({"delay_ms": delay_ms, "attempt": attempt}),
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    continue 'nodes;
                }
                terminal => {
                    record.disposition = terminal.tag().into();
                    let end = Self::decision_to_end(terminal);
                    run.close_node(&self.sink, record);
                    return self.end_run(run, state, end, Some(operator.id.clone()), idx);
                }
            }

            completed_nodes += 1;

            // Stratum ceilings apply between nodes, never mid-step.
            if let Some(p) = &policy {
                if let Some(end) = self.check_stratum_ceilings(p, &started, run.tokens_used) {
                    return self.end_run(run, state, end, None, idx);
                }
                if let Some(interval) = p.checkpoint_interval {
                    if interval > 0 && completed_nodes % interval == 0 {
                        self.snapshot(&run, &state, idx)?;
                        let operator_id = run
                            .nodes
                            .last()
                            .map(|n| n.operator_id.clone())
                            .unwrap_or_else(|| OperatorId::new("engine"));
                        run.emit(
                            &self.sink,
                            EvidenceKind::CheckpointCreated,
                            &operator_id,
                            serde_json::json!({
                                "reason": "interval",
                                "nodes_completed": completed_nodes,
                            }),
                        );
                    }
                }
            }
        }

        let (status, reason) = if run.failed_steps == 0 {
            (RunStatus::Success, None)
        } else {
            let (operator_id, detail) = run
                .last_step_failure
                .clone()
                .unwrap_or((OperatorId::new("unknown"), "step failure".into()));
            (
                RunStatus::Partial,
                Some(ReasonChain::new(
                    Some(operator_id),
                    FailureClass::StepFailure,
                    detail,
                )),
            )
        };

        info!(
            composition_id = %run.composition_id,
            execution_id = %run.execution_id,
            status = ?status,
            tokens_used = run.tokens_used,
            "Execution finished"
        );
        Ok(run.finish(state, ExecutionPhase::Completed, status, reason, None))
    }

    /// Dispatch a node's primitives one at a time, consulting the
    /// interpreter after each outcome. Retry decisions re-dispatch the
    /// same primitive after the requested delay.
    async fn run_sequential_node(
        &self,
        composition: &Composition,
        operator: &Operator,
        interpreter: Arc<dyn OperatorInterpreter>,
        state: &mut ExecutionState,
        run: &mut RunTrace,
        record: &mut NodeRecord,
    ) -> Result<StepFlow> {
        let mut outcomes: Vec<PrimitiveOutcome> = Vec::with_capacity(operator.inputs.len());

        'primitives: for pid in &operator.inputs {
            let primitive = composition.primitive(pid)?.clone();

            loop {
                if self.cancel.is_cancelled() {
                    return Ok(StepFlow::End(RunEnd::Cancelled, "terminate".into()));
                }

                let outcome = match self
                    .dispatch_primitive(&primitive, state, run, &operator.id, record)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(OperonError::Cancelled) => {
                        return Ok(StepFlow::End(RunEnd::Cancelled, "terminate".into()))
                    }
                    Err(e) => {
                        return Ok(StepFlow::End(
                            RunEnd::Fatal {
                                detail: e.to_string(),
                            },
                            "terminate".into(),
                        ))
                    }
                };
                run.account(&operator.id, &outcome, record);

                let decision = {
                    let mut ctx = ExecutionContext::new(
                        &run.composition_id,
                        &run.execution_id,
                        operator,
                        state,
                    );
                    interpreter.after_primitive_execute(&primitive, &outcome, &mut ctx)?
                };

                match decision {
                    OperatorDecision::Continue { outputs } => {
                        // Sequential steps see the accumulated state of the
                        // steps before them.
                        if let serde_json::Value::Object(map) = &outcome.output {
                            if outcome.is_success() {
                                state.merge_outputs(map);
                            }
                        }
                        state.merge_outputs(&outputs);
                        outcomes.push(outcome);
                        continue 'primitives;
                    }
                    OperatorDecision::Retry { delay_ms, attempt } => {
                        run.emit(
                            &self.sink,
                            EvidenceKind::RetryScheduled,
                            &operator.id,
                            serde_json::json!({
                                "primitive_id": primitive.id,
                                "delay_ms": delay_ms,
                                "attempt": attempt,
                            }),
                        );
                        outcomes.push(outcome);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    OperatorDecision::Skip { reason } => {
                        run.emit(
                            &self.sink,
                            EvidenceKind::Skip,
                            &operator.id,
                            serde_json::json!({"reason": reason}),
                        );
                        record.disposition = "skip".into();
                        outcomes.push(outcome);
                        break 'primitives;
                    }
                    OperatorDecision::Branch { target } => {
                        outcomes.push(outcome);
                        return Ok(StepFlow::Jump(target));
                    }
                    terminal => {
                        outcomes.push(outcome);
                        let tag = terminal.tag().to_string();
                        return Ok(StepFlow::End(Self::decision_to_end(terminal), tag));
                    }
                }
            }
        }

        Ok(StepFlow::Completed(outcomes))
    }

    /// Fan a node's primitives out concurrently, then consult the
    /// interpreter per outcome in declared order.
    async fn run_parallel_node(
        &self,
        composition: &Composition,
        operator: &Operator,
        interpreter: Arc<dyn OperatorInterpreter>,
        state: &mut ExecutionState,
        run: &mut RunTrace,
        record: &mut NodeRecord,
    ) -> Result<StepFlow> {
        enum Slot {
            Ready(PrimitiveOutcome),
            Pending(usize),
        }

        let input = state.to_json();
        let mut slots: Vec<(Primitive, Slot)> = Vec::with_capacity(operator.inputs.len());
        let mut futures = Vec::new();

        for pid in &operator.inputs {
            let primitive = composition.primitive(pid)?.clone();
            if let Some(failed) = self.check_preconditions(&primitive, &input, state) {
                slots.push((primitive, Slot::Ready(failed)));
                continue;
            }

            run.emit(
                &self.sink,
                EvidenceKind::PrimitiveDispatch,
                &operator.id,
                serde_json::json!({"primitive_id": primitive.id}),
            );
            record.primitives_dispatched += 1;
            futures.push(self.executor.execute(
                primitive.clone(),
                input.clone(),
                self.cancel.child_token(),
            ));
            slots.push((primitive, Slot::Pending(futures.len() - 1)));
        }

        let mut results = join_all(futures).await;

        let mut outcomes: Vec<PrimitiveOutcome> = Vec::with_capacity(slots.len());
        let mut primitives: Vec<Primitive> = Vec::with_capacity(slots.len());
        for (primitive, slot) in slots {
            let outcome = match slot {
                Slot::Ready(outcome) => outcome,
                Slot::Pending(i) => match std::mem::replace(
                    &mut results[i],
                    Err(OperonError::Executor("outcome already taken".into())),
                ) {
                    Ok(outcome) => self.check_postconditions(&primitive, outcome, state),
                    Err(OperonError::Cancelled) => {
                        return Ok(StepFlow::End(RunEnd::Cancelled, "terminate".into()))
                    }
                    Err(e) => {
                        return Ok(StepFlow::End(
                            RunEnd::Fatal {
                                detail: e.to_string(),
                            },
                            "terminate".into(),
                        ))
                    }
                },
            };
            run.account(&operator.id, &outcome, record);
            primitives.push(primitive);
            outcomes.push(outcome);
        }

        // Per-outcome hook, in declared order. Retries re-dispatch the
        // affected primitive sequentially.
        for i in 0..outcomes.len() {
            loop {
                let decision = {
                    let mut ctx = ExecutionContext::new(
                        &run.composition_id,
                        &run.execution_id,
                        operator,
                        state,
                    );
                    interpreter.after_primitive_execute(&primitives[i], &outcomes[i], &mut ctx)?
                };

                match decision {
                    OperatorDecision::Continue { outputs } => {
                        state.merge_outputs(&outputs);
                        break;
                    }
                    OperatorDecision::Retry { delay_ms, attempt } => {
                        run.emit(
                            &self.sink,
                            EvidenceKind::RetryScheduled,
                            &operator.id,
                            serde_json::json!({
                                "primitive_id": primitives[i].id,
                                "delay_ms": delay_ms,
                                "attempt": attempt,
                            }),
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let outcome = match self
                            .dispatch_primitive(&primitives[i], state, run, &operator.id, record)
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(OperonError::Cancelled) => {
                                return Ok(StepFlow::End(RunEnd::Cancelled, "terminate".into()))
                            }
                            Err(e) => {
                                return Ok(StepFlow::End(
                                    RunEnd::Fatal {
                                        detail: e.to_string(),
                                    },
                                    "terminate".into(),
                                ))
                            }
                        };
                        run.account(&operator.id, &outcome, record);
                        outcomes[i] = outcome;
                    }
                    OperatorDecision::Skip { reason } => {
                        run.emit(
                            &self.sink,
                            EvidenceKind::Skip,
                            &operator.id,
                            serde_json::json!({"reason": reason}),
                        );
                        record.disposition = "skip".into();
                        return Ok(StepFlow::Completed(outcomes));
                    }
                    OperatorDecision::Branch { target } => {
                        return Ok(StepFlow::Jump(target));
                    }
                    terminal => {
                        let tag = terminal.tag().to_string();
                        return Ok(StepFlow::End(Self::decision_to_end(terminal), tag));
                    }
                }
            }
        }

        Ok(StepFlow::Completed(outcomes))
    }

    /// Run one primitive through contract checks and the executor.
    /// Precondition violations fail the step without dispatching.
    async fn dispatch_primitive(
        &self,
        primitive: &Primitive,
        state: &ExecutionState,
        run: &mut RunTrace,
        operator_id: &OperatorId,
        record: &mut NodeRecord,
    ) -> Result<PrimitiveOutcome> {
        let input = state.to_json();
        if let Some(failed) = self.check_preconditions(primitive, &input, state) {
            return Ok(failed);
        }

        run.emit(
            &self.sink,
            EvidenceKind::PrimitiveDispatch,
            operator_id,
            serde_json::json!({"primitive_id": primitive.id}),
        );
        record.primitives_dispatched += 1;

        let outcome = self
            .executor
            .execute(primitive.clone(), input, self.cancel.child_token())
            .await?;
        Ok(self.check_postconditions(primitive, outcome, state))
    }

    /// Returns a synthesized failed outcome when preconditions are
    /// violated, None when dispatch may proceed.
    fn check_preconditions(
        &self,
        primitive: &Primitive,
        input: &serde_json::Value,
        state: &ExecutionState,
    ) -> Option<PrimitiveOutcome> {
        let validator = self.validator.as_ref()?;
        if primitive.preconditions.is_empty() {
            return None;
        }
        let check = validator.check_preconditions(&primitive.preconditions, input, state);
        if check.all_satisfied {
            return None;
        }
        warn!(
            primitive_id = %primitive.id,
            violations = ?check.violations,
            "Precondition violated, step not dispatched"
        );
        Some(
            PrimitiveOutcome::failed(
                primitive.id.clone(),
                format!("Precondition violated: {}", check.violations.join("; ")),
            )
            .with_evidence(vec![contract_violation_evidence(
                "precondition",
                &check.violations,
            )]),
        )
    }

    /// Converts a successful outcome to failed when postconditions are
    /// violated, preserving the evidence already collected.
    fn check_postconditions(
        &self,
        primitive: &Primitive,
        outcome: PrimitiveOutcome,
        state: &ExecutionState,
    ) -> PrimitiveOutcome {
        let Some(validator) = self.validator.as_ref() else {
            return outcome;
        };
        if !outcome.is_success() || primitive.postconditions.is_empty() {
            return outcome;
        }
        let check =
            validator.check_postconditions(&primitive.postconditions, &outcome.output, state);
        if check.all_satisfied {
            return outcome;
        }
        warn!(
            primitive_id = %primitive.id,
            violations = ?check.violations,
            "Postcondition violated, step treated as failed"
        );
        let mut evidence = outcome.evidence;
        evidence.push(contract_violation_evidence("postcondition", &check.violations));
        PrimitiveOutcome::failed(
            primitive.id.clone(),
            format!("Postcondition violated: {}", check.violations.join("; ")),
        )
        .with_evidence(evidence)
    }

    fn check_stratum_ceilings(
        &self,
        policy: &StratumPolicy,
        started: &Instant,
        tokens_used: u64,
    ) -> Option<RunEnd> {
        if let Some(max_ms) = policy.max_duration_ms {
            let elapsed = started.elapsed().as_millis() as u64;
            if elapsed > max_ms {
                return Some(RunEnd::Terminated {
                    reason: format!("Stratum duration ceiling exceeded: {}ms/{}ms", elapsed, max_ms),
                    graceful: true,
                });
            }
        }
        if let Some(max_tokens) = policy.max_tokens {
            if tokens_used > max_tokens {
                return Some(RunEnd::Terminated {
                    reason: format!(
                        "Stratum token ceiling exceeded: {}/{} tokens",
                        tokens_used, max_tokens
                    ),
                    graceful: true,
                });
            }
        }
        None
    }

    fn snapshot(&self, run: &RunTrace, state: &ExecutionState, node_index: usize) -> Result<()> {
        let enabled = self
            .config
            .checkpoint
            .as_ref()
            .map(|c| c.enabled)
            .unwrap_or(true);
        if !enabled {
            return Ok(());
        }
        if let Some(store) = &self.checkpoints {
            let snap = ExecutionSnapshot::new(
                run.execution_id.clone(),
                run.composition_id.clone(),
                node_index,
                state,
                run.tokens_used,
            )?;
            store.save(&snap)?;
        }
        Ok(())
    }

    fn decision_to_end(decision: OperatorDecision) -> RunEnd {
        match decision {
            OperatorDecision::Terminate { reason, graceful } => {
                RunEnd::Terminated { reason, graceful }
            }
            OperatorDecision::Escalate { level, context } => RunEnd::Escalated { level, context },
            OperatorDecision::Checkpoint { reason, state } => {
                RunEnd::Checkpointed { reason, state }
            }
            other => RunEnd::Fatal {
                detail: format!("Unexpected terminal decision '{}'", other.tag()),
            },
        }
    }

    fn end_run(
        &self,
        mut run: RunTrace,
        state: ExecutionState,
        end: RunEnd,
        operator_id: Option<OperatorId>,
        node_index: usize,
    ) -> Result<RunReport> {
        let report = match end {
            RunEnd::Terminated { reason, graceful } => {
                info!(
                    execution_id = %run.execution_id,
                    graceful,
                    reason = %reason,
                    "Run terminated"
                );
                let (status, class) = if graceful {
                    (RunStatus::Partial, FailureClass::GracefulTermination)
                } else {
                    (RunStatus::Failed, FailureClass::StepFailure)
                };
                run.finish(
                    state,
                    ExecutionPhase::Terminated,
                    status,
                    Some(ReasonChain::new(operator_id, class, reason)),
                    None,
                )
            }
            RunEnd::Escalated { level, context } => {
                info!(execution_id = %run.execution_id, ?level, "Run escalated");
                run.finish(
                    state,
                    ExecutionPhase::Escalated,
                    RunStatus::Partial,
                    Some(ReasonChain::new(
                        operator_id,
                        FailureClass::Escalation,
                        "Operator escalated the run",
                    )),
                    Some(EscalationRecord { level, context }),
                )
            }
            RunEnd::Checkpointed {
                reason,
                state: suspended,
            } => {
                self.snapshot(&run, &suspended, node_index)?;
                let op = operator_id
                    .clone()
                    .unwrap_or_else(|| OperatorId::new("engine"));
                run.emit(
                    &self.sink,
                    EvidenceKind::CheckpointCreated,
                    &op,
                    serde_json::json!({"reason": reason}),
                );
                info!(execution_id = %run.execution_id, reason = %reason, "Run suspended");
                run.finish(
                    suspended,
                    ExecutionPhase::Checkpointed,
                    RunStatus::Partial,
                    Some(ReasonChain::new(operator_id, FailureClass::Suspension, reason)),
                    None,
                )
            }
            RunEnd::Cancelled => {
                warn!(execution_id = %run.execution_id, "Run cancelled");
                run.finish(
                    state,
                    ExecutionPhase::Failed,
                    RunStatus::Failed,
                    Some(ReasonChain::new(
                        operator_id,
                        FailureClass::Fatal,
                        "Run cancelled",
                    )),
                    None,
                )
            }
            RunEnd::Fatal { detail } => {
                warn!(execution_id = %run.execution_id, detail = %detail, "Run failed");
                run.finish(
                    state,
                    ExecutionPhase::Failed,
                    RunStatus::Failed,
                    Some(ReasonChain::new(operator_id, FailureClass::Fatal, detail)),
                    None,
                )
            }
        };
        Ok(report)
    }
}

fn trace_phase(run: &RunTrace, phase: ExecutionPhase) {
    debug!(execution_id = %run.execution_id, phase = ?phase, "Phase transition");
}

/// Evidence entry recording which contract clauses a step violated.
fn contract_violation_evidence(stage: &str, violations: &[String]) -> Evidence {
    Evidence::new(
        "contract_violation",
        format!("{} contracts not satisfied", stage),
    )
    .with_metadata(serde_json::json!({"stage": stage, "violations": violations}))
}

/// Outcome of dispatching one node's primitives.
enum StepFlow {
    /// All primitives resolved; proceed to `after_execute`.
    Completed(Vec<PrimitiveOutcome>),
    /// A mid-node decision jumped elsewhere; `after_execute` is skipped.
    Jump(String),
    /// A mid-node decision ended the run; the string is the decision tag
    /// recorded as the node's disposition.
    End(RunEnd, String),
}

/// Accumulating trace of one run: node records, the evidence ledger, and
/// token accounting.
struct RunTrace {
    execution_id: ExecutionId,
    composition_id: CompositionId,
    nodes: Vec<NodeRecord>,
    evidence: Vec<EvidenceId>,
    tokens_used: u64,
    failed_steps: usize,
    last_step_failure: Option<(OperatorId, String)>,
}

impl RunTrace {
    fn emit(
        &mut self,
        sink: &Arc<dyn EvidenceSink>,
        kind: EvidenceKind,
        operator_id: &OperatorId,
        payload: serde_json::Value,
    ) {
        let event = EvidenceEvent::new(
            kind,
            self.composition_id.clone(),
            self.execution_id.clone(),
            operator_id.clone(),
            payload,
        );
        self.evidence.push(event.id.clone());
        sink.emit(event);
    }

    /// Record a resolved node: emits `operator_result` and stores the
    /// node record.
    fn close_node(&mut self, sink: &Arc<dyn EvidenceSink>, record: NodeRecord) {
        let operator_id = record.operator_id.clone();
        let payload = serde_json::json!({
            "disposition": record.disposition,
            "primitives_dispatched": record.primitives_dispatched,
            "failed_primitives": record.failed_primitives,
        });
        self.emit(sink, EvidenceKind::OperatorResult, &operator_id, payload);
        self.nodes.push(record);
    }

    /// Fold one outcome into token and failure accounting.
    fn account(
        &mut self,
        operator_id: &OperatorId,
        outcome: &PrimitiveOutcome,
        record: &mut NodeRecord,
    ) {
        let tokens: u64 = outcome.evidence.iter().filter_map(|e| e.tokens()).sum();
        self.tokens_used += tokens;
        if !outcome.is_success() {
            self.failed_steps += 1;
            record.failed_primitives += 1;
            self.last_step_failure = Some((
                operator_id.clone(),
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Primitive '{}' failed", outcome.primitive_id)),
            ));
        }
    }

    fn finish(
        self,
        state: ExecutionState,
        phase: ExecutionPhase,
        status: RunStatus,
        reason: Option<ReasonChain>,
        escalation: Option<EscalationRecord>,
    ) -> RunReport {
        RunReport {
            execution_id: self.execution_id,
            composition_id: self.composition_id,
            status,
            phase,
            nodes: self.nodes,
            evidence: self.evidence,
            final_state: state,
            tokens_used: self.tokens_used,
            reason,
            escalation,
        }
    }
}
