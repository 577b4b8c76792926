use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::traits::EvidenceSink;
use crate::types::{CompositionId, ExecutionId, OperatorId};

/// A single evidence entry attached to a primitive outcome. Append-only;
/// never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Evidence {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Token usage recorded in this entry's metadata, if any.
    pub fn tokens(&self) -> Option<u64> {
        self.metadata.get("tokens").and_then(|v| v.as_u64())
    }
}

/// Unique identifier for an emitted evidence event.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EvidenceId(pub String);

impl EvidenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for EvidenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle event categories the engine emits to the evidence sink.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    OperatorStart,
    PrimitiveDispatch,
    OperatorResult,
    BranchTaken,
    LoopIteration,
    RetryScheduled,
    Skip,
    CheckpointCreated,
}

/// A structured lifecycle event. Emission is mandatory and ordered: the
/// sink receives `operator_start` before any `primitive_dispatch` for a
/// node, and `operator_result` after the node resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEvent {
    pub id: EvidenceId,
    pub kind: EvidenceKind,
    pub composition_id: CompositionId,
    pub execution_id: ExecutionId,
    pub operator_id: OperatorId,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EvidenceEvent {
    pub fn new(
        kind: EvidenceKind,
        composition_id: CompositionId,
        execution_id: ExecutionId,
        operator_id: OperatorId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EvidenceId::new(),
            kind,
            composition_id,
            execution_id,
            operator_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Evidence sink backed by a tokio broadcast channel.
/// All subscribers receive all events, in emission order.
pub struct BroadcastSink {
    tx: tokio::sync::broadcast::Sender<EvidenceEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EvidenceEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EvidenceSink for BroadcastSink {
    fn emit(&self, event: EvidenceEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }
}

/// In-memory sink that records every event, for assertions in tests and
/// for callers that inspect the ledger after a run.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EvidenceEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EvidenceEvent> {
        self.events.lock().expect("evidence lock poisoned").clone()
    }

    /// Events for one operator, in emission order.
    pub fn events_for(&self, operator_id: &OperatorId) -> Vec<EvidenceEvent> {
        self.events()
            .into_iter()
            .filter(|e| &e.operator_id == operator_id)
            .collect()
    }
}

impl EvidenceSink for RecordingSink {
    fn emit(&self, event: EvidenceEvent) {
        self.events.lock().expect("evidence lock poisoned").push(event);
    }
}
