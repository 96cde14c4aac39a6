//! Shared types, errors, and run modes for the Cadence timeline engine.
//!
//! This crate provides the foundational types used across all other Cadence crates:
//! - `CadenceError` — unified error taxonomy
//! - `TrialRecord` — the flat key-value record produced by one completed trial
//! - `Progress` — mid-run progress snapshot
//! - `RunMode` / `SimulationMode` — how a run invokes its collaborators

use serde::{Deserialize, Serialize};

/// Unified error type for all Cadence subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    // === Configuration errors (fatal to the run) ===
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timeline variable '{name}' is not bound at node '{node_id}'")]
    UnboundVariable { name: String, node_id: String },

    #[error("missing required parameter '{param}' for plugin '{plugin}' at node '{node_id}'")]
    MissingParameter {
        param: String,
        plugin: String,
        node_id: String,
    },

    #[error("no plugin registered under name '{plugin}' (node '{node_id}')")]
    UnknownPlugin { plugin: String, node_id: String },

    #[error("no extension registered under name '{extension}'")]
    UnknownExtension { extension: String },

    #[error("extension '{extension}' failed in {hook}: {message}")]
    ExtensionHook {
        extension: String,
        hook: String,
        message: String,
    },

    // === Randomization errors (fatal to the calling operation only) ===
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsatisfiable ordering constraint: {0}")]
    Unsatisfiable(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CadenceError {
    /// Returns `true` if the error indicates a malformed experiment
    /// configuration. Configuration errors abort the whole run: downstream
    /// data would be silently wrong if the engine skipped the node instead.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CadenceError::Configuration(_)
                | CadenceError::UnboundVariable { .. }
                | CadenceError::MissingParameter { .. }
                | CadenceError::UnknownPlugin { .. }
                | CadenceError::UnknownExtension { .. }
                | CadenceError::ExtensionHook { .. }
        )
    }
}

/// A convenience alias for `Result<T, CadenceError>`.
pub type Result<T> = std::result::Result<T, CadenceError>;

// ---------------------------------------------------------------------------
// TrialRecord — the flat key-value record produced by one completed trial
// ---------------------------------------------------------------------------

/// A flat key-value result record. Plugins, extensions, and the data store
/// all trade in this shape.
pub type TrialRecord = serde_json::Map<String, serde_json::Value>;

/// Merge `overlay` into `base`, with `overlay` winning on key collisions.
pub fn merge_records(base: &mut TrialRecord, overlay: &TrialRecord) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Build a [`TrialRecord`] from a `serde_json::Value::Object`. Returns an
/// empty record for any other value shape.
pub fn record_from_value(value: serde_json::Value) -> TrialRecord {
    match value {
        serde_json::Value::Object(map) => map,
        _ => TrialRecord::new(),
    }
}

// ---------------------------------------------------------------------------
// Run modes
// ---------------------------------------------------------------------------

/// Simulation sub-mode: how synthesized responses are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulationMode {
    /// Resolve each trial immediately with synthesized data.
    DataOnly,
    /// Exercise the plugin's real timing path, dispatching synthetic
    /// responses after the synthesized response time.
    Visual,
}

/// How a run invokes its collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Wait for real participant input.
    Normal,
    /// Synthesize responses instead of waiting.
    Simulate(SimulationMode),
}

impl RunMode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, RunMode::Simulate(_))
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Normal
    }
}

// ---------------------------------------------------------------------------
// Progress — mid-run progress snapshot
// ---------------------------------------------------------------------------

/// Snapshot of run progress, derived purely from the experiment description's
/// shape and the engine's cursor position. The totals are naive: loops and
/// conditionals are not (and cannot be) accounted for ahead of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Naive total number of trials in the experiment.
    pub total_trials: usize,
    /// Naive total number of timeline nodes in the experiment.
    pub total_timelines: usize,
    /// Number of trials completed so far, across the whole run.
    pub current_trial_global: usize,
    /// Number of trials completed within the current timeline pass.
    pub current_trial_local: usize,
    /// Number of timeline nodes entered so far.
    pub current_timeline: usize,
}

impl Progress {
    /// Fraction of naive total trials completed, in `[0, 1]`.
    pub fn percent_complete(&self) -> f64 {
        if self.total_trials == 0 {
            return 1.0;
        }
        (self.current_trial_global as f64 / self.total_trials as f64).min(1.0)
    }
}
