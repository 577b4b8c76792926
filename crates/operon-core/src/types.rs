use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::BranchRule;
use crate::error::{OperonError, Result};
use crate::evidence::Evidence;
use crate::state::ExecutionState;

/// Unique identifier for a primitive.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveId(pub String);

impl PrimitiveId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an operator node.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct OperatorId(pub String);

impl OperatorId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a composition.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CompositionId(pub String);

impl CompositionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for CompositionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one execution run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an externally supplied id, as read back from persistence.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque contract clause attached to a primitive, checked by the
/// external `ContractValidator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub name: String,
    pub rule: String,
}

impl Contract {
    pub fn new(name: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rule: rule.into(),
        }
    }
}

/// An atomic, externally-executed task step. Immutable once registered;
/// compositions reference primitives by id, never by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Primitive {
    pub id: PrimitiveId,
    pub name: String,
    #[serde(default)]
    pub input_spec: serde_json::Value,
    #[serde(default)]
    pub output_spec: serde_json::Value,
    #[serde(default)]
    pub preconditions: Vec<Contract>,
    #[serde(default)]
    pub postconditions: Vec<Contract>,
}

impl Primitive {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: PrimitiveId::new(id),
            name: name.into(),
            input_spec: serde_json::Value::Null,
            output_spec: serde_json::Value::Null,
            preconditions: vec![],
            postconditions: vec![],
        }
    }

    pub fn with_preconditions(mut self, contracts: Vec<Contract>) -> Self {
        self.preconditions = contracts;
        self
    }

    pub fn with_postconditions(mut self, contracts: Vec<Contract>) -> Self {
        self.postconditions = contracts;
        self
    }
}

/// Closed set of operator kinds. Unknown tags fail at deserialization,
/// and `match` over this enum is checked exhaustively at compile time.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Sequence,
    Parallel,
    Conditional,
    Loop,
    Retry,
    CircuitBreaker,
    Fallback,
    Quorum,
    Consensus,
    Timebox,
    BudgetCap,
}

impl OperatorKind {
    /// All kinds, in a stable order. Used by registry exhaustiveness checks.
    pub const ALL: [OperatorKind; 11] = [
        OperatorKind::Sequence,
        OperatorKind::Parallel,
        OperatorKind::Conditional,
        OperatorKind::Loop,
        OperatorKind::Retry,
        OperatorKind::CircuitBreaker,
        OperatorKind::Fallback,
        OperatorKind::Quorum,
        OperatorKind::Consensus,
        OperatorKind::Timebox,
        OperatorKind::BudgetCap,
    ];
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            OperatorKind::Sequence => "sequence",
            OperatorKind::Parallel => "parallel",
            OperatorKind::Conditional => "conditional",
            OperatorKind::Loop => "loop",
            OperatorKind::Retry => "retry",
            OperatorKind::CircuitBreaker => "circuit_breaker",
            OperatorKind::Fallback => "fallback",
            OperatorKind::Quorum => "quorum",
            OperatorKind::Consensus => "consensus",
            OperatorKind::Timebox => "timebox",
            OperatorKind::BudgetCap => "budget_cap",
        };
        write!(f, "{}", tag)
    }
}

/// An operator node: a control-flow / resilience / coordination wrapper
/// around one or more primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub id: OperatorId,
    pub kind: OperatorKind,
    /// Primitives this node dispatches, in declaration order.
    #[serde(default)]
    pub inputs: Vec<PrimitiveId>,
    /// Primitives whose outputs this node is expected to surface.
    #[serde(default)]
    pub outputs: Vec<PrimitiveId>,
    /// Kind-specific condition strings (branch rules, loop predicates).
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Kind-specific parameters, deserialized by the owning interpreter.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl Operator {
    pub fn new(id: impl Into<String>, kind: OperatorKind) -> Self {
        Self {
            id: OperatorId::new(id),
            kind,
            inputs: vec![],
            outputs: vec![],
            conditions: vec![],
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<&str>) -> Self {
        self.inputs = inputs.into_iter().map(PrimitiveId::new).collect();
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<&str>) -> Self {
        self.conditions = conditions.into_iter().map(String::from).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Loop termination predicates accepted in `Operator::conditions` on a
/// `loop` node.
pub const LOOP_PREDICATES: [&str; 4] = [
    "all_success",
    "any_success",
    "verification_passed",
    "confidence_threshold",
];

/// An immutable executable plan: primitives plus the operator nodes that
/// wrap them. Validated on construction, read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Composition {
    id: CompositionId,
    primitives: Vec<Primitive>,
    operators: Vec<Operator>,
}

impl Composition {
    /// Build a composition, checking structural integrity up front:
    /// unique ids, input/output references to declared primitives,
    /// parseable conditional branch rules, known loop predicates, and
    /// resolvable branch targets.
    pub fn new(
        id: impl Into<String>,
        primitives: Vec<Primitive>,
        operators: Vec<Operator>,
    ) -> Result<Self> {
        let id = CompositionId::new(id);

        let mut primitive_ids = HashSet::new();
        for p in &primitives {
            if !primitive_ids.insert(p.id.clone()) {
                return Err(OperonError::InvalidComposition(format!(
                    "Duplicate primitive id '{}'",
                    p.id
                )));
            }
        }

        let mut operator_ids = HashSet::new();
        for op in &operators {
            if !operator_ids.insert(op.id.clone()) {
                return Err(OperonError::InvalidComposition(format!(
                    "Duplicate operator id '{}'",
                    op.id
                )));
            }
            for pid in op.inputs.iter().chain(op.outputs.iter()) {
                if !primitive_ids.contains(pid) {
                    return Err(OperonError::UnknownPrimitive(format!(
                        "Operator '{}' references undeclared primitive '{}'",
                        op.id, pid
                    )));
                }
            }
        }

        let composition = Self {
            id,
            primitives,
            operators,
        };

        for op in &composition.operators {
            match op.kind {
                OperatorKind::Conditional => {
                    for cond in &op.conditions {
                        let rule = BranchRule::parse(cond)?;
                        composition.resolve_branch_target(&rule.target)?;
                    }
                    if let Some(target) =
                        op.parameters.get("default_target").and_then(|v| v.as_str())
                    {
                        composition.resolve_branch_target(target)?;
                    }
                }
                OperatorKind::Loop => {
                    for cond in &op.conditions {
                        if !LOOP_PREDICATES.contains(&cond.as_str()) {
                            return Err(OperonError::InvalidComposition(format!(
                                "Operator '{}' uses unknown loop predicate '{}'",
                                op.id, cond
                            )));
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(composition)
    }

    pub fn id(&self) -> &CompositionId {
        &self.id
    }

    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn primitive(&self, id: &PrimitiveId) -> Result<&Primitive> {
        self.primitives
            .iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| OperonError::UnknownPrimitive(id.to_string()))
    }

    /// Resolve a branch target to an operator index. A target names an
    /// operator id first; failing that, the earliest declared operator
    /// whose inputs contain the target primitive id.
    pub fn resolve_branch_target(&self, target: &str) -> Result<usize> {
        if let Some(idx) = self.operators.iter().position(|op| op.id.0 == target) {
            return Ok(idx);
        }
        let as_primitive = PrimitiveId::new(target);
        self.operators
            .iter()
            .position(|op| op.inputs.contains(&as_primitive))
            .ok_or_else(|| OperonError::UnknownBranchTarget(target.to_string()))
    }
}

/// Outcome status reported by the external executor for one primitive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveStatus {
    Success,
    Failed,
}

/// Result of executing one primitive, produced by the external
/// `PrimitiveExecutor` and consumed by interpreters. Ephemeral: only the
/// derived decisions and evidence persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveOutcome {
    pub primitive_id: PrimitiveId,
    pub status: PrimitiveStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PrimitiveOutcome {
    pub fn success(primitive_id: PrimitiveId, output: serde_json::Value) -> Self {
        Self {
            primitive_id,
            status: PrimitiveStatus::Success,
            output,
            evidence: vec![],
            error: None,
        }
    }

    pub fn failed(primitive_id: PrimitiveId, error: impl Into<String>) -> Self {
        Self {
            primitive_id,
            status: PrimitiveStatus::Failed,
            output: serde_json::Value::Null,
            evidence: vec![],
            error: Some(error.into()),
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<Evidence>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == PrimitiveStatus::Success
    }
}

/// Escalation recipient for decisions that hand the run off.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    Human,
    Supervisor,
}

/// The decision an interpreter hook returns. Exactly one variant per hook
/// invocation; every consumer matches exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum OperatorDecision {
    /// Proceed; `outputs` are merged into run state by the orchestrator.
    Continue {
        outputs: serde_json::Map<String, serde_json::Value>,
    },
    /// Skip this node without dispatching (further) primitives.
    Skip { reason: String },
    /// Jump to a named target node.
    Branch { target: String },
    /// Re-dispatch after a delay. The orchestrator performs the wait.
    Retry { delay_ms: u64, attempt: u32 },
    /// Stop the run. Graceful terminations are recorded, not escalated.
    Terminate { reason: String, graceful: bool },
    /// Hand the run to a human or supervising agent.
    Escalate {
        level: EscalationLevel,
        context: serde_json::Value,
    },
    /// Suspend the run, persisting state for later resume.
    Checkpoint {
        reason: String,
        state: ExecutionState,
    },
}

impl OperatorDecision {
    pub fn continue_empty() -> Self {
        OperatorDecision::Continue {
            outputs: serde_json::Map::new(),
        }
    }

    pub fn continue_with(outputs: serde_json::Map<String, serde_json::Value>) -> Self {
        OperatorDecision::Continue { outputs }
    }

    /// Short tag for logging and evidence payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            OperatorDecision::Continue { .. } => "continue",
            OperatorDecision::Skip { .. } => "skip",
            OperatorDecision::Branch { .. } => "branch",
            OperatorDecision::Retry { .. } => "retry",
            OperatorDecision::Terminate { .. } => "terminate",
            OperatorDecision::Escalate { .. } => "escalate",
            OperatorDecision::Checkpoint { .. } => "checkpoint",
        }
    }
}

/// Key for circuit-breaker state: scoped to one operator within one
/// composition, never a process-global map.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BreakerKey {
    pub composition_id: CompositionId,
    pub operator_id: OperatorId,
}

impl BreakerKey {
    pub fn new(composition_id: CompositionId, operator_id: OperatorId) -> Self {
        Self {
            composition_id,
            operator_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit-breaker state. Outlives a single run; persisted via the
/// injected `CircuitBreakerStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            failures: 0,
            last_failure: None,
        }
    }
}

/// A composition's inferred termination/resource-boundedness class.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stratum {
    Finite,
    Bounded,
    Productive,
    Unrestricted,
}

/// Enforcement policy for a stratum, layered as hard ceilings on top of
/// any per-operator timebox/budget_cap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumPolicy {
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub checkpoint_interval: Option<u32>,
    #[serde(default)]
    pub human_approval_required: bool,
    #[serde(default = "default_autonomous")]
    pub autonomous_execution: bool,
}

fn default_autonomous() -> bool {
    true
}

impl Default for StratumPolicy {
    fn default() -> Self {
        Self {
            max_duration_ms: None,
            max_tokens: None,
            checkpoint_interval: None,
            human_approval_required: false,
            autonomous_execution: true,
        }
    }
}

/// Result of an external contract check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractCheck {
    pub all_satisfied: bool,
    pub violations: Vec<String>,
}

impl ContractCheck {
    pub fn satisfied() -> Self {
        Self {
            all_satisfied: true,
            violations: vec![],
        }
    }

    pub fn violated(violations: Vec<String>) -> Self {
        Self {
            all_satisfied: false,
            violations,
        }
    }
}

/// Build a HashMap index from primitive id to declaration position.
/// Used for deterministic, declaration-ordered merges.
pub fn declaration_order(ids: &[PrimitiveId]) -> HashMap<PrimitiveId, usize> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect()
}
