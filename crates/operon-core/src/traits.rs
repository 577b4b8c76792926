use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::evidence::EvidenceEvent;
use crate::state::{ExecutionContext, ExecutionState};
use crate::types::{
    BreakerKey, BreakerState, Contract, ContractCheck, OperatorDecision, OperatorKind, Primitive,
    PrimitiveOutcome, Stratum, StratumPolicy,
};

/// Primitive executor: what a leaf step actually does (LLM calls, file
/// reads, shell commands) lives behind this trait, outside the engine.
///
/// Implementations must be safe to invoke concurrently (parallel nodes fan
/// out), and must report ordinary failures as `PrimitiveStatus::Failed`
/// rather than `Err`; an `Err` is a contract violation the engine treats
/// as fatal.
pub trait PrimitiveExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        primitive: Primitive,
        input: serde_json::Value,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<PrimitiveOutcome>>;
}

/// Optional contract validator. When present for a primitive, the engine
/// checks preconditions before dispatch and postconditions after a
/// successful result; violations convert the step to failed before the
/// owning operator sees it.
pub trait ContractValidator: Send + Sync + 'static {
    fn check_preconditions(
        &self,
        contracts: &[Contract],
        input: &serde_json::Value,
        state: &ExecutionState,
    ) -> ContractCheck;

    fn check_postconditions(
        &self,
        contracts: &[Contract],
        output: &serde_json::Value,
        state: &ExecutionState,
    ) -> ContractCheck;
}

/// Evidence sink: receives every lifecycle event, in emission order.
pub trait EvidenceSink: Send + Sync + 'static {
    fn emit(&self, event: EvidenceEvent);
}

/// Circuit-breaker state store, injected at engine construction and keyed
/// by `(composition_id, operator_id)`. Breaker state is the one piece of
/// state that must outlive a single run.
pub trait CircuitBreakerStore: Send + Sync + 'static {
    fn load(&self, key: &BreakerKey) -> BreakerState;
    fn store(&self, key: &BreakerKey, state: BreakerState);
}

/// Stratum policy lookup: maps a composition's expressiveness class to
/// the enforcement ceilings the engine must apply.
pub trait StratumPolicyLookup: Send + Sync + 'static {
    fn policy_for(&self, stratum: Stratum) -> StratumPolicy;
}

/// Operator interpreter: one per operator kind, exposing three lifecycle
/// hooks. Hooks must be side-effect-free with respect to anything outside
/// `ctx.state` and the returned decision; the orchestrator performs all
/// externally observable effects (waits, evidence, dispatch).
///
/// The circuit breaker is the sanctioned exception: it reads and writes
/// its injected store, because breaker state must survive the run.
pub trait OperatorInterpreter: Send + Sync + 'static {
    /// The operator kind this interpreter handles.
    fn kind(&self) -> OperatorKind;

    /// Called before any primitive of the node executes. May skip the
    /// node, branch away, or veto dispatch.
    fn before_execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<OperatorDecision> {
        let _ = ctx;
        Ok(OperatorDecision::continue_empty())
    }

    /// Called once per completed primitive. May retry, branch, or
    /// terminate based on that single outcome.
    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        outcome: &PrimitiveOutcome,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let _ = (primitive, outcome, ctx);
        Ok(OperatorDecision::continue_empty())
    }

    /// Called once all primitives for the node have completed. Aggregates
    /// outcomes into the node's final contribution. The default merges
    /// successful outputs by key in outcome order (last-result-wins).
    fn after_execute(
        &self,
        outcomes: &[PrimitiveOutcome],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let _ = ctx;
        Ok(OperatorDecision::continue_with(merge_success_outputs(
            outcomes,
        )))
    }
}

/// Merge the output objects of successful outcomes by key, in the order
/// given (last-result-wins). Non-object outputs are stored under the
/// primitive id.
pub fn merge_success_outputs(
    outcomes: &[PrimitiveOutcome],
) -> serde_json::Map<String, serde_json::Value> {
    let mut merged = serde_json::Map::new();
    for outcome in outcomes.iter().filter(|o| o.is_success()) {
        match &outcome.output {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
            serde_json::Value::Null => {}
            other => {
                merged.insert(outcome.primitive_id.to_string(), other.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveId;

    #[test]
    fn test_merge_success_outputs_last_wins() {
        let outcomes = vec![
            PrimitiveOutcome::success(
                PrimitiveId::new("p1"),
                serde_json::json!({"shared": 1, "a": "x"}),
            ),
            PrimitiveOutcome::failed(PrimitiveId::new("p2"), "ignored"),
            PrimitiveOutcome::success(PrimitiveId::new("p3"), serde_json::json!({"shared": 2})),
        ];
        let merged = merge_success_outputs(&outcomes);
        assert_eq!(merged["shared"], serde_json::json!(2));
        assert_eq!(merged["a"], serde_json::json!("x"));
        assert!(!merged.contains_key("p2"));
    }

    #[test]
    fn test_merge_non_object_output_keyed_by_id() {
        let outcomes = vec![PrimitiveOutcome::success(
            PrimitiveId::new("p1"),
            serde_json::json!("plain text"),
        )];
        let merged = merge_success_outputs(&outcomes);
        assert_eq!(merged["p1"], serde_json::json!("plain text"));
    }
}
