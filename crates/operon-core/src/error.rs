use thiserror::Error;

use crate::types::OperatorKind;

#[derive(Debug, Error)]
pub enum OperonError {
    // Composition errors
    #[error("Operator type not supported: {0:?}")]
    OperatorUnsupported(OperatorKind),

    #[error("Invalid composition: {0}")]
    InvalidComposition(String),

    #[error("Invalid condition expression: {0}")]
    InvalidCondition(String),

    #[error("Invalid parameters for operator {operator}: {message}")]
    InvalidParameters { operator: String, message: String },

    #[error("Unknown primitive: {0}")]
    UnknownPrimitive(String),

    #[error("Unknown branch target: {0}")]
    UnknownBranchTarget(String),

    // Execution errors
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Executor contract violation: {0}")]
    Executor(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OperonError>;
