//! Resilience interpreters: retry, circuit_breaker, fallback.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use operon_core::error::Result;
use operon_core::state::ExecutionContext;
use operon_core::traits::{CircuitBreakerStore, OperatorInterpreter};
use operon_core::types::{
    BreakerKey, BreakerState, BreakerStatus, Operator, OperatorDecision, OperatorKind, Primitive,
    PrimitiveOutcome,
};

use crate::parse_params;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
    ExponentialJitter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryParams {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            strategy: BackoffStrategy::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

/// Backoff delay for the given attempt (1-based).
fn backoff_delay(strategy: BackoffStrategy, base_ms: u64, attempt: u32) -> u64 {
    match strategy {
        BackoffStrategy::Constant => base_ms,
        BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            base_ms.saturating_mul(1u64 << (attempt - 1).min(32))
        }
        BackoffStrategy::ExponentialJitter => {
            let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(32));
            let jitter = (exp as f64 * rand::thread_rng().gen::<f64>() * 0.3) as u64;
            exp.saturating_add(jitter)
        }
    }
}

/// Re-dispatches failed primitives with backoff. Counters live in run
/// state keyed per primitive, so independent steps retry independently.
pub struct RetryInterpreter;

impl RetryInterpreter {
    fn counter_key(primitive: &Primitive) -> String {
        format!("retry::{}::count", primitive.id)
    }
}

impl OperatorInterpreter for RetryInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Retry
    }

    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        outcome: &PrimitiveOutcome,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let key = Self::counter_key(primitive);

        if outcome.is_success() {
            ctx.state.remove(&key);
            return Ok(OperatorDecision::continue_empty());
        }

        let params: RetryParams = parse_params(ctx.operator)?;
        let attempt = ctx.state.get_u64(&key).unwrap_or(0) as u32 + 1;
        ctx.state.set(&key, serde_json::json!(attempt));

        if attempt > params.max_retries {
            warn!(
                primitive_id = %primitive.id,
                attempts = attempt,
                "Retries exhausted"
            );
            return Ok(OperatorDecision::Terminate {
                reason: format!(
                    "Primitive '{}' failed after {} retries",
                    primitive.id, params.max_retries
                ),
                graceful: true,
            });
        }

        let delay_ms = backoff_delay(params.strategy, params.base_delay_ms, attempt);
        debug!(
            primitive_id = %primitive.id,
            attempt,
            delay_ms,
            "Scheduling retry"
        );
        Ok(OperatorDecision::Retry { delay_ms, attempt })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerParams {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerParams {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

/// Closed/open/half-open gate around a node. Breaker state outlives a run,
/// so this interpreter reads and writes its injected store rather than run
/// state; it is the only interpreter permitted that external effect.
pub struct CircuitBreakerInterpreter {
    store: Arc<dyn CircuitBreakerStore>,
}

impl CircuitBreakerInterpreter {
    pub fn new(store: Arc<dyn CircuitBreakerStore>) -> Self {
        Self { store }
    }

    fn key(ctx: &ExecutionContext<'_>) -> BreakerKey {
        BreakerKey::new(ctx.composition_id.clone(), ctx.operator.id.clone())
    }
}

impl OperatorInterpreter for CircuitBreakerInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::CircuitBreaker
    }

    fn before_execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<OperatorDecision> {
        let params: CircuitBreakerParams = parse_params(ctx.operator)?;
        let key = Self::key(ctx);
        let breaker = self.store.load(&key);

        match breaker.status {
            BreakerStatus::Closed | BreakerStatus::HalfOpen => {
                Ok(OperatorDecision::continue_empty())
            }
            BreakerStatus::Open => {
                let elapsed_ms = breaker
                    .last_failure
                    .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
                    .unwrap_or(u64::MAX);

                if elapsed_ms >= params.reset_timeout_ms {
                    debug!(
                        operator_id = %ctx.operator.id,
                        "Breaker reset timeout elapsed, allowing trial"
                    );
                    self.store.store(
                        &key,
                        BreakerState {
                            status: BreakerStatus::HalfOpen,
                            ..breaker
                        },
                    );
                    Ok(OperatorDecision::continue_empty())
                } else {
                    let remaining = params.reset_timeout_ms - elapsed_ms;
                    Ok(OperatorDecision::Skip {
                        reason: format!("Circuit open, {}ms until trial allowed", remaining),
                    })
                }
            }
        }
    }

    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        outcome: &PrimitiveOutcome,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let params: CircuitBreakerParams = parse_params(ctx.operator)?;
        let key = Self::key(ctx);
        let mut breaker = self.store.load(&key);

        if outcome.is_success() {
            if breaker.status == BreakerStatus::HalfOpen {
                debug!(operator_id = %ctx.operator.id, "Trial succeeded, closing breaker");
            }
            breaker.status = BreakerStatus::Closed;
            breaker.failures = 0;
            breaker.last_failure = None;
            self.store.store(&key, breaker);
            return Ok(OperatorDecision::continue_empty());
        }

        breaker.failures += 1;
        breaker.last_failure = Some(Utc::now());
        if breaker.status == BreakerStatus::HalfOpen || breaker.failures >= params.failure_threshold
        {
            warn!(
                operator_id = %ctx.operator.id,
                primitive_id = %primitive.id,
                failures = breaker.failures,
                "Opening circuit"
            );
            breaker.status = BreakerStatus::Open;
        }
        self.store.store(&key, breaker);
        Ok(OperatorDecision::continue_empty())
    }
}

/// Ordered alternatives. Primitives are dispatched in declaration order;
/// the first success stops further dispatch, exhaustion terminates the
/// run gracefully.
pub struct FallbackInterpreter;

impl FallbackInterpreter {
    fn attempted_key(operator: &Operator) -> String {
        format!("fallback::{}::attempted", operator.id)
    }
}

impl OperatorInterpreter for FallbackInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Fallback
    }

    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        outcome: &PrimitiveOutcome,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let key = Self::attempted_key(ctx.operator);
        let mut attempted: Vec<String> = ctx
            .state
            .get(&key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        attempted.push(primitive.id.to_string());
        let exhausted = attempted.len() >= ctx.operator.inputs.len();
        ctx.state.set(&key, serde_json::json!(attempted));

        if outcome.is_success() {
            // Remaining alternatives are not dispatched.
            return Ok(OperatorDecision::Skip {
                reason: format!("Fallback satisfied by '{}'", primitive.id),
            });
        }

        if exhausted {
            return Ok(OperatorDecision::Terminate {
                reason: "All fallback paths exhausted".into(),
                graceful: true,
            });
        }

        debug!(
            operator_id = %ctx.operator.id,
            failed = %primitive.id,
            "Falling through to next alternative"
        );
        Ok(OperatorDecision::continue_empty())
    }
}
