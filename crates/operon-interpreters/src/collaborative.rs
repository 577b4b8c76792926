//! Collaborative interpreters: quorum and consensus.
//!
//! Both aggregate the conclusions of multiple primitives (typically
//! parallel agent analyses) into a single decision, bucketing votes by
//! structural equality so key order never splits agreement.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use operon_core::error::Result;
use operon_core::state::ExecutionContext;
use operon_core::traits::OperatorInterpreter;
use operon_core::types::{
    EscalationLevel, OperatorDecision, OperatorKind, PrimitiveOutcome,
};

use crate::canonical::Tally;
use crate::parse_params;

/// The value a primitive votes with: its output's `conclusion` field when
/// the output is an object carrying one, otherwise the whole output.
fn vote_of(outcome: &PrimitiveOutcome) -> &serde_json::Value {
    match &outcome.output {
        serde_json::Value::Object(map) => map.get("conclusion").unwrap_or(&outcome.output),
        other => other,
    }
}

fn tally_successes(outcomes: &[PrimitiveOutcome]) -> Tally {
    let mut tally = Tally::new();
    for outcome in outcomes.iter().filter(|o| o.is_success()) {
        tally.add(vote_of(outcome));
    }
    tally
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuorumParams {
    /// Votes needed to proceed. Defaults to a simple majority of the
    /// node's declared inputs.
    #[serde(default)]
    pub required: Option<usize>,
}

/// Proceeds when enough primitives agree; escalates to a human otherwise.
pub struct QuorumInterpreter;

impl OperatorInterpreter for QuorumInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Quorum
    }

    fn after_execute(
        &self,
        outcomes: &[PrimitiveOutcome],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let params: QuorumParams = parse_params(ctx.operator)?;
        let required = params
            .required
            .unwrap_or(ctx.operator.inputs.len() / 2 + 1);

        let tally = tally_successes(outcomes);
        let winner = tally.winner();

        match winner {
            Some(bucket) if bucket.votes >= required => {
                debug!(
                    operator_id = %ctx.operator.id,
                    votes = bucket.votes,
                    required,
                    "Quorum reached"
                );
                let mut outputs = serde_json::Map::new();
                outputs.insert("quorum_reached".into(), serde_json::json!(true));
                outputs.insert("conclusion".into(), bucket.conclusion.clone());
                outputs.insert("votes".into(), serde_json::json!(bucket.votes));
                outputs.insert("required".into(), serde_json::json!(required));
                outputs.insert(
                    "dissent".into(),
                    serde_json::Value::Array(
                        tally
                            .dissent()
                            .iter()
                            .map(|b| {
                                serde_json::json!({
                                    "conclusion": b.conclusion,
                                    "votes": b.votes,
                                })
                            })
                            .collect(),
                    ),
                );
                Ok(OperatorDecision::continue_with(outputs))
            }
            _ => {
                let best = winner.map(|b| b.votes).unwrap_or(0);
                warn!(
                    operator_id = %ctx.operator.id,
                    best,
                    required,
                    "Quorum not reached"
                );
                Ok(OperatorDecision::Escalate {
                    level: EscalationLevel::Human,
                    context: serde_json::json!({
                        "reason": format!("Quorum not reached: {}/{} votes", best, required),
                        "votes": best,
                        "required": required,
                        "positions": tally.positions(),
                    }),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// How disagreement resolves: `"escalate"` (default) hands the split
    /// to a human, `"majority"` takes the largest bucket.
    #[serde(default)]
    pub resolution: Option<String>,
}

/// Requires unanimous agreement; disagreement either escalates or falls
/// back to majority per the node's resolution parameter.
pub struct ConsensusInterpreter;

impl OperatorInterpreter for ConsensusInterpreter {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Consensus
    }

    fn after_execute(
        &self,
        outcomes: &[PrimitiveOutcome],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperatorDecision> {
        let params: ConsensusParams = parse_params(ctx.operator)?;
        let tally = tally_successes(outcomes);

        if tally.is_empty() {
            return Ok(OperatorDecision::Escalate {
                level: EscalationLevel::Human,
                context: serde_json::json!({
                    "reason": "Consensus impossible: no successful conclusions",
                    "positions": tally.positions(),
                }),
            });
        }

        if tally.distinct() == 1 {
            let bucket = tally
                .winner()
                .ok_or_else(|| operon_core::OperonError::InvalidComposition(
                    "Consensus tally lost its only bucket".into(),
                ))?;
            let mut outputs = serde_json::Map::new();
            outputs.insert("unanimous".into(), serde_json::json!(true));
            outputs.insert("conclusion".into(), bucket.conclusion.clone());
            outputs.insert("votes".into(), serde_json::json!(bucket.votes));
            return Ok(OperatorDecision::continue_with(outputs));
        }

        if params.resolution.as_deref() == Some("majority") {
            if let Some(bucket) = tally.winner() {
                debug!(
                    operator_id = %ctx.operator.id,
                    votes = bucket.votes,
                    distinct = tally.distinct(),
                    "Resolving split by majority"
                );
                let mut outputs = serde_json::Map::new();
                outputs.insert("unanimous".into(), serde_json::json!(false));
                outputs.insert("method".into(), serde_json::json!("majority"));
                outputs.insert("conclusion".into(), bucket.conclusion.clone());
                outputs.insert("votes".into(), serde_json::json!(bucket.votes));
                return Ok(OperatorDecision::continue_with(outputs));
            }
        }

        warn!(
            operator_id = %ctx.operator.id,
            distinct = tally.distinct(),
            "Consensus not reached"
        );
        Ok(OperatorDecision::Escalate {
            level: EscalationLevel::Human,
            context: serde_json::json!({
                "reason": "Consensus not reached",
                "positions": tally.positions(),
            }),
        })
    }
}
