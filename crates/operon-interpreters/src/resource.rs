//! Resource-bounding interpreters: timebox and budget_cap.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use operon_core::error::Result;
use operon_core::state::ExecutionContext;
use operon_core::traits::OperatorInterpreter;
use operon_core::types::{
    Operator, OperatorDecision, OperatorKind, Primitive, PrimitiveOutcome,
};

use crate::parse_params;

/// Run-wide token accumulator key. Shared across budget_cap nodes so the
/// cap applies to the whole run, not per node.
pub const TOKENS_USED_KEY: &str = "budget::tokens_used";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Terminate,
    Checkpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeboxParams {
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default)]
    pub on_timeout: TimeoutAction,
}

impl Default for TimeboxParams {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            on_timeout: TimeoutAction::default(),
        }
    }
}

fn default_max_duration_ms() -> u64 {
    300_000
}

/// Wall-clock bound on a node. The deadline is fixed when the node is
/// entered and checked after every primitive; a running primitive is never
/// interrupted, so overruns are detected at the next step boundary.
pub struct TimeboxInterpreter;

impl TimeboxInterpreter {
    fn deadline_key(operator: &Operator) -> String {
        format!("timebox::{}::deadline_ms", operator.id)
    }
}

impl OperatorInterpreter for TimeboxInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Timebox
    }

    fn before_execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<OperatorDecision> {
        let params: TimeboxParams = parse_params(ctx.operator)?;
        let deadline = Utc::now().timestamp_millis() as u64 + params.max_duration_ms;
        ctx.state
            .set(Self::deadline_key(ctx.operator), serde_json::json!(deadline));
        Ok(OperatorDecision::continue_empty())
    }

    fn after_primitive_execute(
        &self,
        _primitive: &Primitive,
        _outcome: &PrimitiveOutcome,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let params: TimeboxParams = parse_params(ctx.operator)?;
        let key = Self::deadline_key(ctx.operator);
        let Some(deadline) = ctx.state.get_u64(&key) else {
            return Ok(OperatorDecision::continue_empty());
        };

        let now = Utc::now().timestamp_millis() as u64;
        if now < deadline {
            return Ok(OperatorDecision::continue_empty());
        }

        warn!(
            operator_id = %ctx.operator.id,
            overrun_ms = now - deadline,
            "Time budget exceeded"
        );
        match params.on_timeout {
            TimeoutAction::Terminate => Ok(OperatorDecision::Terminate {
                reason: format!(
                    "Time budget of {}ms exceeded on '{}'",
                    params.max_duration_ms, ctx.operator.id
                ),
                graceful: true,
            }),
            TimeoutAction::Checkpoint => Ok(OperatorDecision::Checkpoint {
                reason: format!(
                    "Time budget of {}ms exceeded on '{}'",
                    params.max_duration_ms, ctx.operator.id
                ),
                state: ctx.state.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCapParams {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

impl Default for BudgetCapParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> u64 {
    100_000
}

/// Token-spend bound. Every outcome's evidence token counts accumulate
/// into a run-wide counter; crossing the cap stops the run at the next
/// step boundary rather than clawing back spend already incurred.
pub struct BudgetCapInterpreter;

impl OperatorInterpreter for BudgetCapInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::BudgetCap
    }

    fn after_primitive_execute(
        &self,
        _primitive: &Primitive,
        outcome: &PrimitiveOutcome,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let params: BudgetCapParams = parse_params(ctx.operator)?;

        let spent: u64 = outcome.evidence.iter().filter_map(|e| e.tokens()).sum();
        let used = ctx.state.get_u64(TOKENS_USED_KEY).unwrap_or(0) + spent;
        ctx.state.set(TOKENS_USED_KEY, serde_json::json!(used));

        if used > params.max_tokens {
            warn!(
                operator_id = %ctx.operator.id,
                used,
                max_tokens = params.max_tokens,
                "Token budget exceeded"
            );
            return Ok(OperatorDecision::Terminate {
                reason: format!("Budget exceeded: {}/{} tokens", used, params.max_tokens),
                graceful: true,
            });
        }

        Ok(OperatorDecision::continue_empty())
    }
}
