pub mod condition;
pub mod config;
pub mod error;
pub mod evidence;
pub mod state;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{OperonError, Result};
pub use evidence::{BroadcastSink, Evidence, EvidenceEvent, EvidenceId, EvidenceKind, RecordingSink};
pub use state::{ExecutionContext, ExecutionState};
pub use types::*;
