//! Interpreter registry: the closed dispatch table from operator kind to
//! interpreter. Lookup failures surface before any primitive dispatches.

use std::collections::HashMap;
use std::sync::Arc;

use operon_core::error::{OperonError, Result};
use operon_core::traits::{CircuitBreakerStore, OperatorInterpreter};
use operon_core::types::OperatorKind;

use crate::collaborative::{ConsensusInterpreter, QuorumInterpreter};
use crate::control::{
    ConditionalInterpreter, LoopInterpreter, ParallelInterpreter, SequenceInterpreter,
};
use crate::resilience::{CircuitBreakerInterpreter, FallbackInterpreter, RetryInterpreter};
use crate::resource::{BudgetCapInterpreter, TimeboxInterpreter};

pub struct InterpreterRegistry {
    interpreters: HashMap<OperatorKind, Arc<dyn OperatorInterpreter>>,
}

impl InterpreterRegistry {
    pub fn new() -> Self {
        Self {
            interpreters: HashMap::new(),
        }
    }

    /// Registry with all eleven built-in interpreters. The breaker store
    /// is injected because breaker state must survive individual runs.
    pub fn with_defaults(breaker_store: Arc<dyn CircuitBreakerStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SequenceInterpreter));
        registry.register(Arc::new(ParallelInterpreter));
        registry.register(Arc::new(ConditionalInterpreter));
        registry.register(Arc::new(LoopInterpreter));
        registry.register(Arc::new(RetryInterpreter));
        registry.register(Arc::new(CircuitBreakerInterpreter::new(breaker_store)));
        registry.register(Arc::new(FallbackInterpreter));
        registry.register(Arc::new(QuorumInterpreter));
        registry.register(Arc::new(ConsensusInterpreter));
        registry.register(Arc::new(TimeboxInterpreter));
        registry.register(Arc::new(BudgetCapInterpreter));
        registry
    }

    /// Register an interpreter under its own kind, replacing any existing
    /// registration for that kind.
    pub fn register(&mut self, interpreter: Arc<dyn OperatorInterpreter>) {
        self.interpreters.insert(interpreter.kind(), interpreter);
    }

    pub fn get(&self, kind: OperatorKind) -> Result<Arc<dyn OperatorInterpreter>> {
        self.interpreters
            .get(&kind)
            .cloned()
            .ok_or(OperonError::OperatorUnsupported(kind))
    }

    pub fn supports(&self, kind: OperatorKind) -> bool {
        self.interpreters.contains_key(&kind)
    }

    /// Kinds with no registered interpreter, in stable declaration order.
    pub fn missing_kinds(&self) -> Vec<OperatorKind> {
        OperatorKind::ALL
            .into_iter()
            .filter(|k| !self.supports(*k))
            .collect()
    }
}

impl Default for InterpreterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
