pub mod breaker;
pub mod checkpoint;
pub mod engine;
pub mod report;
pub mod stratum;

pub use breaker::InMemoryBreakerStore;
pub use checkpoint::{CheckpointStore, ExecutionSnapshot};
pub use engine::Engine;
pub use report::{
    EscalationRecord, ExecutionPhase, FailureClass, NodeRecord, ReasonChain, RunReport, RunStatus,
};
pub use stratum::FixedStratumPolicies;
