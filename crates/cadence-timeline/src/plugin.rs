//! Plugin trait, trial-lifecycle context, and the plugin registry.
//!
//! A plugin owns the interactive part of a single trial: it receives fully
//! resolved parameters, runs to completion, and returns its result record.
//! Plugins are looked up by name at execution time, so a definition can
//! reference a plugin that is registered later, as long as it exists by the
//! time the trial runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_rand::RngHandle;
use cadence_types::{CadenceError, Result, SimulationMode, TrialRecord};
use serde_json::json;

// ---------------------------------------------------------------------------
// Trial context
// ---------------------------------------------------------------------------

type LoadHook = Box<dyn Fn() + Send + Sync>;

/// Per-trial handle passed to a plugin. Its one job is the load
/// notification: a plugin that performs meaningful setup calls
/// [`notify_loaded`](TrialContext::notify_loaded) when its stimulus is
/// ready, which runs the on-load hooks of the trial's active extensions.
/// The hook fires at most once; if the plugin never calls it, the executor
/// fires it after the trial resolves so extensions always observe a load.
pub struct TrialContext {
    on_load: LoadHook,
    fired: AtomicBool,
}

impl TrialContext {
    pub fn new(on_load: LoadHook) -> Self {
        Self {
            on_load,
            fired: AtomicBool::new(false),
        }
    }

    /// A context with no load hooks, for plugins under test.
    pub fn noop() -> Self {
        Self::new(Box::new(|| {}))
    }

    /// Signal that the trial's stimulus is loaded. Idempotent.
    pub fn notify_loaded(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.on_load)();
        }
    }

    pub fn load_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TrialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialContext")
            .field("fired", &self.load_fired())
            .finish()
    }
}

/// Shared slot for an error raised from inside a load hook. Hooks run as
/// plain closures, so failures surface through this side channel and are
/// checked by the executor once the trial resolves.
#[derive(Debug, Clone, Default)]
pub struct HookErrorSlot(Arc<Mutex<Option<CadenceError>>>);

impl HookErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first error; later ones are dropped.
    pub fn set(&self, err: CadenceError) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<CadenceError> {
        self.0.lock().unwrap().take()
    }
}

// ---------------------------------------------------------------------------
// Simulation options
// ---------------------------------------------------------------------------

/// Per-plugin overrides applied to synthesized simulation data.
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    overrides: HashMap<String, TrialRecord>,
}

impl SimulationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, plugin: &str, data: TrialRecord) -> Self {
        self.overrides.insert(plugin.to_string(), data);
        self
    }

    pub fn data_for(&self, plugin: &str) -> Option<&TrialRecord> {
        self.overrides.get(plugin)
    }
}

/// Shared synthesis for simulated trials: an ex-Gaussian response time, a
/// response drawn from `choices` when one is present, then any per-plugin
/// overrides on top.
fn synthesize_response(
    plugin: &str,
    params: &TrialRecord,
    options: &SimulationOptions,
    rng: &mut RngHandle,
) -> TrialRecord {
    let rt = cadence_rand::sample_ex_gaussian(500.0, 50.0, 1.0 / 150.0, true, rng).round();

    let mut data = TrialRecord::new();
    data.insert("rt".to_string(), json!(rt));
    if let Some(choices) = params.get("choices").and_then(|v| v.as_array()) {
        if !choices.is_empty() {
            data.insert(
                "response".to_string(),
                choices[rng.next_index(choices.len())].clone(),
            );
        }
    }
    if let Some(overrides) = options.data_for(plugin) {
        cadence_types::merge_records(&mut data, overrides);
    }
    data
}

/// Fire the load hook and, in visual mode, dwell for the record's
/// response time.
async fn settle(ctx: &TrialContext, mode: SimulationMode, data: &TrialRecord) {
    ctx.notify_loaded();
    if mode == SimulationMode::Visual {
        let dwell = data.get("rt").and_then(|v| v.as_f64()).unwrap_or(0.0);
        tokio::time::sleep(std::time::Duration::from_millis(dwell.max(0.0) as u64)).await;
    }
}

// ---------------------------------------------------------------------------
// Plugin trait
// ---------------------------------------------------------------------------

/// One trial type. Implementations are registered by
/// [`name`](Plugin::name) and shared behind `Arc`, so they hold no
/// per-trial state.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry key, matched against a trial's `type` field.
    fn name(&self) -> &str;

    /// Parameters that must resolve to a value before the trial may run.
    fn required_params(&self) -> &[&str] {
        &[]
    }

    /// Run the trial and return its result record. Plugins do not fail:
    /// anything noteworthy goes into the record.
    async fn trial(&self, ctx: &TrialContext, params: &TrialRecord) -> TrialRecord;

    /// Produce a plausible result without running the real trial. The
    /// default synthesizes a response time from an ex-Gaussian
    /// distribution, picks a response from a `choices` parameter when one
    /// is present, applies any per-plugin overrides, and in visual mode
    /// dwells for the synthesized response time.
    async fn simulate(
        &self,
        ctx: &TrialContext,
        params: &TrialRecord,
        mode: SimulationMode,
        options: &SimulationOptions,
        rng: &mut RngHandle,
    ) -> TrialRecord {
        let data = synthesize_response(self.name(), params, options, rng);
        settle(ctx, mode, &data).await;
        data
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed plugin lookup table.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoPlugin));
        registry
    }

    /// Register a plugin under its own name, replacing any previous
    /// registration for that name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    /// Look up a plugin, attributing a miss to the node that referenced it.
    pub fn get(&self, name: &str, node_id: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| CadenceError::UnknownPlugin {
                plugin: name.to_string(),
                node_id: node_id.to_string(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in: echo
// ---------------------------------------------------------------------------

/// Minimal reference plugin: echoes its `stimulus` parameter back into the
/// result record. Useful for smoke tests and as a template for real
/// plugins.
#[derive(Debug, Clone, Copy)]
pub struct EchoPlugin;

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn required_params(&self) -> &[&str] {
        &["stimulus"]
    }

    async fn trial(&self, ctx: &TrialContext, params: &TrialRecord) -> TrialRecord {
        ctx.notify_loaded();
        let mut data = TrialRecord::new();
        data.insert(
            "stimulus".to_string(),
            params.get("stimulus").cloned().unwrap_or(serde_json::Value::Null),
        );
        data
    }

    /// Simulated echo trials still carry the stimulus; the synthesized
    /// response data (and any overrides) merge over it.
    async fn simulate(
        &self,
        ctx: &TrialContext,
        params: &TrialRecord,
        mode: SimulationMode,
        options: &SimulationOptions,
        rng: &mut RngHandle,
    ) -> TrialRecord {
        let mut data = TrialRecord::new();
        data.insert(
            "stimulus".to_string(),
            params.get("stimulus").cloned().unwrap_or(serde_json::Value::Null),
        );
        cadence_types::merge_records(
            &mut data,
            &synthesize_response(self.name(), params, options, rng),
        );
        settle(ctx, mode, &data).await;
        data
    }
}
