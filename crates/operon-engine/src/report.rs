//! Run reports: what a composition execution produced and why it ended.

use serde::{Deserialize, Serialize};

use operon_core::evidence::EvidenceId;
use operon_core::state::ExecutionState;
use operon_core::types::{CompositionId, EscalationLevel, ExecutionId, OperatorId, OperatorKind};

/// Phase of one execution run. The transient phases never appear in a
/// finished report; they are surfaced through tracing for observers
/// watching a live run. Terminal phases: `Completed` (every node
/// resolved), `Terminated` (an operator stopped the run), `Escalated`,
/// `Checkpointed` (suspended, resumable), and `Failed` (aborted).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Pending,
    Dispatching,
    AwaitingPrimitives,
    EvaluatingResult,
    Branching,
    Retrying,
    Skipping,
    Continuing,
    Completed,
    Terminated,
    Escalated,
    Checkpointed,
    Failed,
}

impl ExecutionPhase {
    /// True for phases a finished run can report.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Completed
                | ExecutionPhase::Terminated
                | ExecutionPhase::Escalated
                | ExecutionPhase::Checkpointed
                | ExecutionPhase::Failed
        )
    }
}

/// Overall run verdict.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every node resolved and every dispatched primitive succeeded.
    Success,
    /// The run ended deliberately short of full success: graceful
    /// termination, escalation, suspension, or completed with failed
    /// steps absorbed by their operators.
    Partial,
    /// The run stopped for a reason nobody chose.
    Failed,
}

/// Classification of why a run stopped early.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Unrecoverable: executor contract breach, cancellation, or an
    /// operator kind with no interpreter.
    Fatal,
    /// A primitive failed and no operator absorbed it.
    StepFailure,
    /// An operator chose to stop the run cleanly.
    GracefulTermination,
    /// The run was handed to a human or supervisor.
    Escalation,
    /// The run was suspended with persisted state.
    Suspension,
}

/// Why the run ended, attributed to the node that decided it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonChain {
    pub operator_id: Option<OperatorId>,
    pub classification: FailureClass,
    pub detail: String,
}

impl ReasonChain {
    pub fn new(
        operator_id: Option<OperatorId>,
        classification: FailureClass,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            operator_id,
            classification,
            detail: detail.into(),
        }
    }
}

/// How one node resolved during the run. Nodes entered more than once
/// (loops, branches) get one record per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub operator_id: OperatorId,
    pub kind: OperatorKind,
    /// Decision tag that resolved the node: `continue`, `skip`, `branch`,
    /// `terminate`, `escalate`, or `checkpoint`.
    pub disposition: String,
    pub primitives_dispatched: usize,
    pub failed_primitives: usize,
}

/// The complete record of one execution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub composition_id: CompositionId,
    pub status: RunStatus,
    pub phase: ExecutionPhase,
    pub nodes: Vec<NodeRecord>,
    /// Ids of every evidence event emitted, in emission order.
    pub evidence: Vec<EvidenceId>,
    pub final_state: ExecutionState,
    pub tokens_used: u64,
    pub reason: Option<ReasonChain>,
    /// Present when the run ended escalated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationRecord>,
}

/// Escalation details for runs that ended handed off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub level: EscalationLevel,
    pub context: serde_json::Value,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Total primitive dispatches across all node entries.
    pub fn primitives_dispatched(&self) -> usize {
        self.nodes.iter().map(|n| n.primitives_dispatched).sum()
    }
}
