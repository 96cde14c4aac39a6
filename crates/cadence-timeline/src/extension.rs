//! Extensions: cross-cutting collaborators that observe every trial.
//!
//! An extension registers once per run, initializes before the first trial,
//! and then receives lifecycle hooks for each trial that lists it. Hooks
//! always run in registration order, regardless of the order a trial names
//! its extensions, so data contributed by two extensions lands in a stable
//! order. A failing hook is fatal to the run: extension data is assumed to
//! matter to the experiment.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_types::{CadenceError, Result, TrialRecord};

/// A run-scoped trial observer. Implementations needing mutable state keep
/// it behind interior mutability; the manager shares each extension as
/// `Arc<dyn Extension>`.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Registry key, matched against a trial's `extensions` list.
    fn name(&self) -> &str;

    /// One-time setup, before any trial runs. Receives the parameters the
    /// extension was registered with.
    async fn initialize(&self, params: &TrialRecord) -> Result<()> {
        let _ = params;
        Ok(())
    }

    /// Called before the trial's plugin runs. May rewrite the trial's
    /// resolved parameters.
    fn on_start(&self, params: &mut TrialRecord) -> Result<()> {
        let _ = params;
        Ok(())
    }

    /// Called when the trial's stimulus is loaded.
    fn on_load(&self) -> Result<()> {
        Ok(())
    }

    /// Called after the trial resolves; the returned record is merged into
    /// the trial's data under keys prefixed with the extension's name.
    async fn on_finish(&self) -> Result<TrialRecord> {
        Ok(TrialRecord::new())
    }
}

struct Registration {
    extension: Arc<dyn Extension>,
    init_params: TrialRecord,
}

/// Ordered extension registry. Holds every extension for the run and
/// dispatches lifecycle hooks to the subset a given trial activates.
#[derive(Default)]
pub struct ExtensionManager {
    registrations: Vec<Registration>,
}

impl ExtensionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension with its initialization parameters. Order of
    /// registration is the order every hook runs in.
    pub fn register(&mut self, extension: Arc<dyn Extension>, init_params: TrialRecord) {
        self.registrations.push(Registration {
            extension,
            init_params,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.registrations
            .iter()
            .any(|r| r.extension.name() == name)
    }

    /// Initialize every registered extension, in registration order.
    pub async fn initialize_all(&self) -> Result<()> {
        for reg in &self.registrations {
            reg.extension
                .initialize(&reg.init_params)
                .await
                .map_err(|e| hook_error(reg.extension.name(), "initialize", e))?;
        }
        Ok(())
    }

    /// Resolve a trial's extension name list into handles, in registration
    /// order. Every name must be registered.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Extension>>> {
        for name in names {
            if !self.has(name) {
                return Err(CadenceError::UnknownExtension {
                    extension: name.clone(),
                });
            }
        }
        Ok(self
            .registrations
            .iter()
            .filter(|r| names.iter().any(|n| n == r.extension.name()))
            .map(|r| r.extension.clone())
            .collect())
    }

    /// Run `on_start` for the active extensions against the trial's
    /// resolved parameters.
    pub fn on_start(
        &self,
        active: &[Arc<dyn Extension>],
        params: &mut TrialRecord,
    ) -> Result<()> {
        for ext in active {
            ext.on_start(params)
                .map_err(|e| hook_error(ext.name(), "on_start", e))?;
        }
        Ok(())
    }

    /// Run `on_load` for the active extensions.
    pub fn on_load(&self, active: &[Arc<dyn Extension>]) -> Result<()> {
        for ext in active {
            ext.on_load()
                .map_err(|e| hook_error(ext.name(), "on_load", e))?;
        }
        Ok(())
    }

    /// Run `on_finish` for the active extensions and collect their data.
    /// Each key is namespaced as `<extension>_<key>`; with duplicate
    /// registrations of one name, later hooks win.
    pub async fn collect_on_finish(&self, active: &[Arc<dyn Extension>]) -> Result<TrialRecord> {
        let mut merged = TrialRecord::new();
        for ext in active {
            let data = ext
                .on_finish()
                .await
                .map_err(|e| hook_error(ext.name(), "on_finish", e))?;
            for (key, value) in data {
                merged.insert(format!("{}_{}", ext.name(), key), value);
            }
        }
        Ok(merged)
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .registrations
            .iter()
            .map(|r| r.extension.name())
            .collect();
        f.debug_struct("ExtensionManager")
            .field("registrations", &names)
            .finish()
    }
}

fn hook_error(extension: &str, hook: &str, err: CadenceError) -> CadenceError {
    match err {
        // Already attributed; don't re-wrap.
        e @ CadenceError::ExtensionHook { .. } => e,
        other => CadenceError::ExtensionHook {
            extension: extension.to_string(),
            hook: hook.to_string(),
            message: other.to_string(),
        },
    }
}
