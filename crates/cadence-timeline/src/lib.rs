//! Timeline execution engine, data store, plugin seam, and extensions.
//!
//! This crate implements the core Cadence runner: declarative trial and
//! timeline descriptions, iterative tree traversal with timeline variables,
//! sampling and looping, the append-only data store with CSV/JSON export,
//! and the plugin/extension protocols.

pub mod data;
pub mod definition;
pub mod engine;
pub mod events;
pub mod extension;
pub mod node;
pub mod plugin;

pub use data::{DataCollection, DataStore, InteractionEvent, InteractionRecord};
pub use definition::{load_definition, validate, Diagnostic, Severity};
pub use engine::{Executor, RunCallbacks, RunConfig, RunOutcome};
pub use events::{EventEmitter, RunEvent};
pub use extension::{Extension, ExtensionManager};
pub use node::{
    naive_timeline_count, naive_trial_count, NodeDesc, NodeId, ParamValue, SampleSpec,
    TimelineDesc, TrialDesc,
};
pub use plugin::{
    EchoPlugin, Plugin, PluginRegistry, SimulationOptions, TrialContext,
};
