use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OperonError, Result};
use crate::types::Stratum;

/// Engine-level configuration. Per-operator behavior (retry counts, loop
/// caps, breaker thresholds) lives in operator parameters; this covers the
/// knobs that belong to the orchestrator itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Guard against unbounded branch cycles outside loop operators: a run
    /// terminates gracefully once any single node has been entered this
    /// many times.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,

    /// Capacity of the broadcast evidence channel.
    #[serde(default = "default_evidence_capacity")]
    pub evidence_capacity: usize,

    /// Operator-supplied approval for strata that gate autonomous
    /// execution. Without it, gated runs end escalated before dispatch.
    #[serde(default)]
    pub approved: bool,

    /// Declared expressiveness class of compositions run by this engine.
    #[serde(default)]
    pub stratum: Option<Stratum>,

    /// Checkpoint persistence configuration.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_visits: default_max_node_visits(),
            evidence_capacity: default_evidence_capacity(),
            approved: false,
            stratum: None,
            checkpoint: None,
        }
    }
}

fn default_max_node_visits() -> u32 {
    1000
}

fn default_evidence_capacity() -> usize {
    256
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable checkpointing (default: true when the section is present).
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// Path of the checkpoint database file.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_checkpoint_enabled() -> bool {
    true
}

impl EngineConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OperonError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
