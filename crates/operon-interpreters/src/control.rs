//! Control-flow interpreters: sequence, parallel, conditional, loop.

use serde::{Deserialize, Serialize};
use tracing::debug;

use operon_core::condition::BranchRule;
use operon_core::error::Result;
use operon_core::state::ExecutionContext;
use operon_core::traits::{merge_success_outputs, OperatorInterpreter};
use operon_core::types::{Operator, OperatorDecision, OperatorKind, PrimitiveOutcome};

use crate::parse_params;

/// Strict in-order execution. The default hooks already express sequence
/// semantics; node-to-node ordering is the orchestrator's job.
pub struct SequenceInterpreter;

impl OperatorInterpreter for SequenceInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Sequence
    }
}

/// Concurrent fan-out. Individual completions are ignored; the merge in
/// `after_execute` walks outcomes in declared primitive order so the
/// merged map is deterministic regardless of completion timing.
pub struct ParallelInterpreter;

impl OperatorInterpreter for ParallelInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Parallel
    }

    fn after_execute(
        &self,
        outcomes: &[PrimitiveOutcome],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let ordered = order_by_declaration(outcomes, ctx.operator);
        Ok(OperatorDecision::continue_with(merge_success_outputs(
            &ordered,
        )))
    }
}

/// Reorder outcomes to match the operator's declared input order.
/// Outcomes for re-dispatched or unknown primitives keep arrival order at
/// the end.
fn order_by_declaration(outcomes: &[PrimitiveOutcome], operator: &Operator) -> Vec<PrimitiveOutcome> {
    let mut ordered: Vec<PrimitiveOutcome> = Vec::with_capacity(outcomes.len());
    for id in &operator.inputs {
        ordered.extend(
            outcomes
                .iter()
                .filter(|o| &o.primitive_id == id)
                .cloned(),
        );
    }
    for outcome in outcomes {
        if !operator.inputs.contains(&outcome.primitive_id) {
            ordered.push(outcome.clone());
        }
    }
    ordered
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionalParams {
    #[serde(default)]
    pub default_target: Option<String>,
}

/// Routes by evaluating an ordered list of `"expr => target"` rules
/// against run state. First match wins; an optional default target covers
/// the fall-through, otherwise the node is skipped.
pub struct ConditionalInterpreter;

impl OperatorInterpreter for ConditionalInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Conditional
    }

    fn before_execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<OperatorDecision> {
        let params: ConditionalParams = parse_params(ctx.operator)?;

        for raw in &ctx.operator.conditions {
            let rule = BranchRule::parse(raw)?;
            if rule.evaluate(ctx.state) {
                debug!(
                    operator_id = %ctx.operator.id,
                    condition = %raw,
                    target = %rule.target,
                    "Condition matched"
                );
                return Ok(OperatorDecision::Branch {
                    target: rule.target,
                });
            }
        }

        if let Some(target) = params.default_target {
            return Ok(OperatorDecision::Branch { target });
        }

        Ok(OperatorDecision::Skip {
            reason: "No condition matched and no default target configured".into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopParams {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_max_iterations() -> u32 {
    100
}

fn default_confidence_threshold() -> f64 {
    0.8
}

/// Bounded re-entry. The iteration counter lives in run state, so loop
/// iterations are strictly ordered within a run; the cap guarantees the
/// counter never exceeds `max_iterations`.
pub struct LoopInterpreter;

impl LoopInterpreter {
    fn counter_key(operator: &Operator) -> String {
        format!("loop::{}::iterations", operator.id)
    }

    /// Current iteration count for a loop node, read from run state.
    pub fn iterations(state: &operon_core::state::ExecutionState, operator: &Operator) -> u64 {
        state.get_u64(&Self::counter_key(operator)).unwrap_or(0)
    }
}

impl OperatorInterpreter for LoopInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Loop
    }

    fn before_execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<OperatorDecision> {
        let params: LoopParams = parse_params(ctx.operator)?;
        let key = Self::counter_key(ctx.operator);
        let count = ctx.state.get_u64(&key).unwrap_or(0);

        if count >= u64::from(params.max_iterations) {
            return Ok(OperatorDecision::Terminate {
                reason: format!(
                    "Loop iteration limit reached ({} iterations)",
                    params.max_iterations
                ),
                graceful: true,
            });
        }

        ctx.state.set(key, serde_json::json!(count + 1));
        Ok(OperatorDecision::continue_empty())
    }

    fn after_execute(
        &self,
        outcomes: &[PrimitiveOutcome],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let params: LoopParams = parse_params(ctx.operator)?;

        let satisfied = ctx.operator.conditions.iter().any(|predicate| {
            match predicate.as_str() {
                "all_success" => !outcomes.is_empty() && outcomes.iter().all(|o| o.is_success()),
                "any_success" => outcomes.iter().any(|o| o.is_success()),
                "verification_passed" => {
                    ctx.state.get_bool("verification_passed").unwrap_or(false)
                }
                "confidence_threshold" => ctx
                    .state
                    .get_f64("confidence")
                    .is_some_and(|c| c >= params.confidence_threshold),
                // Unknown names are rejected at composition load.
                _ => false,
            }
        });

        if satisfied {
            let mut outputs = merge_success_outputs(outcomes);
            outputs.insert("loop_completed".into(), serde_json::json!(true));
            return Ok(OperatorDecision::continue_with(outputs));
        }

        match ctx.operator.inputs.first() {
            Some(first) => Ok(OperatorDecision::Branch {
                target: first.to_string(),
            }),
            None => Ok(OperatorDecision::continue_empty()),
        }
    }
}
