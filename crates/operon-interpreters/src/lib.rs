pub mod canonical;
pub mod collaborative;
pub mod control;
pub mod registry;
pub mod resilience;
pub mod resource;

pub use collaborative::{ConsensusInterpreter, QuorumInterpreter};
pub use control::{
    ConditionalInterpreter, LoopInterpreter, ParallelInterpreter, SequenceInterpreter,
};
pub use registry::InterpreterRegistry;
pub use resilience::{CircuitBreakerInterpreter, FallbackInterpreter, RetryInterpreter};
pub use resource::{BudgetCapInterpreter, TimeboxInterpreter};

use operon_core::error::{OperonError, Result};
use operon_core::types::Operator;

/// Deserialize an operator's kind-specific parameters, falling back to the
/// struct's defaults when the parameter object is absent.
pub(crate) fn parse_params<T>(operator: &Operator) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match &operator.parameters {
        serde_json::Value::Null => Ok(T::default()),
        value => {
            serde_json::from_value(value.clone()).map_err(|e| OperonError::InvalidParameters {
                operator: operator.id.to_string(),
                message: e.to_string(),
            })
        }
    }
}
