//! Stratum enforcement policies.
//!
//! A composition's stratum classifies how bounded its execution is; the
//! policy table maps each class to the ceilings the engine enforces on
//! top of per-operator timebox and budget_cap settings.

use std::collections::HashMap;

use operon_core::traits::StratumPolicyLookup;
use operon_core::types::{Stratum, StratumPolicy};

/// Policy table with a fixed entry per stratum.
pub struct FixedStratumPolicies {
    policies: HashMap<Stratum, StratumPolicy>,
}

impl FixedStratumPolicies {
    /// Default ceilings: finite runs are unconstrained, bounded and
    /// productive runs get duration/token ceilings (productive ones also
    /// periodic snapshots), unrestricted runs require human approval.
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        policies.insert(Stratum::Finite, StratumPolicy::default());
        policies.insert(
            Stratum::Bounded,
            StratumPolicy {
                max_duration_ms: Some(600_000),
                max_tokens: Some(1_000_000),
                ..StratumPolicy::default()
            },
        );
        policies.insert(
            Stratum::Productive,
            StratumPolicy {
                max_duration_ms: Some(3_600_000),
                max_tokens: Some(10_000_000),
                checkpoint_interval: Some(10),
                ..StratumPolicy::default()
            },
        );
        policies.insert(
            Stratum::Unrestricted,
            StratumPolicy {
                human_approval_required: true,
                autonomous_execution: false,
                checkpoint_interval: Some(5),
                ..StratumPolicy::default()
            },
        );
        Self { policies }
    }

    pub fn with_policy(mut self, stratum: Stratum, policy: StratumPolicy) -> Self {
        self.policies.insert(stratum, policy);
        self
    }
}

impl Default for FixedStratumPolicies {
    fn default() -> Self {
        Self::new()
    }
}

impl StratumPolicyLookup for FixedStratumPolicies {
    fn policy_for(&self, stratum: Stratum) -> StratumPolicy {
        self.policies.get(&stratum).cloned().unwrap_or_default()
    }
}
