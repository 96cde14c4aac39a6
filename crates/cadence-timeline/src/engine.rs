//! The timeline executor: iterative traversal of the experiment tree with a
//! single outstanding trial at a time.
//!
//! The executor walks the declarative node tree with an explicit frame
//! stack rather than recursion, so loop and conditional predicates can be
//! evaluated lazily at the moment a timeline is entered or finishes a pass,
//! against whatever data exists at that point. Exactly one trial future is
//! awaited at a time; completion order therefore equals presentation order,
//! and the data store never sees interleaved writes.

use std::time::Instant;

use cadence_rand::RngHandle;
use cadence_types::{
    merge_records, CadenceError, Progress, Result, RunMode, SimulationMode, TrialRecord,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::data::{DataCollection, DataStore};
use crate::events::{EventEmitter, RunEvent};
use crate::extension::ExtensionManager;
use crate::node::{
    naive_timeline_count, naive_trial_count, NodeDesc, NodeId, ParamValue, SampleSpec,
    TimelineDesc, TrialDesc,
};
use crate::plugin::{HookErrorSlot, PluginRegistry, SimulationOptions, TrialContext};

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

pub type TrialCallback = Box<dyn FnMut(&TrialRecord) + Send>;
pub type FinishCallback = Box<dyn FnMut(&DataCollection) + Send>;

/// Embedder hooks observed at trial boundaries. All are optional.
#[derive(Default)]
pub struct RunCallbacks {
    /// Fired with the resolved parameters, before extensions see them.
    pub on_trial_start: Option<TrialCallback>,
    /// Fired with the final stored record.
    pub on_trial_finish: Option<TrialCallback>,
    /// Fired with the final stored record, after every write.
    pub on_data_update: Option<TrialCallback>,
    /// Fired once with the full dataset when the run completes normally.
    pub on_finish: Option<FinishCallback>,
}

/// Per-run settings.
pub struct RunConfig {
    pub mode: RunMode,
    /// Seed for the run's RNG; `None` draws one from entropy. The chosen
    /// value is reported in the outcome either way.
    pub seed: Option<u64>,
    /// Inter-trial gap applied when a trial has no `post_trial_gap` param.
    pub default_iti_ms: u64,
    pub simulation_options: SimulationOptions,
    pub callbacks: RunCallbacks,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Normal,
            seed: None,
            default_iti_ms: 0,
            simulation_options: SimulationOptions::new(),
            callbacks: RunCallbacks::default(),
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn default_iti_ms(mut self, ms: u64) -> Self {
        self.default_iti_ms = ms;
        self
    }

    pub fn simulation_options(mut self, options: SimulationOptions) -> Self {
        self.simulation_options = options;
        self
    }

    pub fn on_trial_start<F: FnMut(&TrialRecord) + Send + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_trial_start = Some(Box::new(f));
        self
    }

    pub fn on_trial_finish<F: FnMut(&TrialRecord) + Send + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_trial_finish = Some(Box::new(f));
        self
    }

    pub fn on_data_update<F: FnMut(&TrialRecord) + Send + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_data_update = Some(Box::new(f));
        self
    }

    pub fn on_finish<F: FnMut(&DataCollection) + Send + 'static>(mut self, f: F) -> Self {
        self.callbacks.on_finish = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("mode", &self.mode)
            .field("seed", &self.seed)
            .field("default_iti_ms", &self.default_iti_ms)
            .finish()
    }
}

/// What a completed run hands back.
#[derive(Debug)]
pub struct RunOutcome {
    /// Snapshot of all trial records, in presentation order.
    pub data: DataCollection,
    /// The full store, for node-scoped queries and interaction records.
    pub store: DataStore,
    /// The seed the run actually used (explicit or drawn).
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub trials_run: usize,
}

// ---------------------------------------------------------------------------
// Traversal frames
// ---------------------------------------------------------------------------

/// One active timeline on the traversal stack.
struct Frame {
    desc: TimelineDesc,
    id: NodeId,
    /// Materialized pass order: one entry per pass through the children,
    /// holding the variable-set index (or `None` when the timeline has no
    /// variables).
    pass_order: Vec<Option<usize>>,
    pass_idx: usize,
    child_idx: usize,
    /// Counts every pass through the children, across repetitions and loop
    /// iterations; feeds the iteration half of child node ids.
    children_iteration: usize,
    repetition: usize,
    /// Store length when the current loop iteration began; the loop
    /// predicate sees only records written at or after it.
    watermark: usize,
    /// Variable set of the most recently finished pass, for the
    /// no-repeats seam rule on regeneration.
    last_set: Option<usize>,
    /// Trials completed in the current pass.
    local_trials: usize,
    passes_done: usize,
}

impl Frame {
    fn current_set(&self) -> Option<usize> {
        self.pass_order.get(self.pass_idx).copied().flatten()
    }

    fn lookup_var(&self, name: &str) -> Option<&Value> {
        self.current_set()
            .and_then(|i| self.desc.timeline_variables.get(i))
            .and_then(|set| set.get(name))
    }
}

/// Materialize the order of variable-set passes for one repetition. With no
/// variables a timeline still runs its children once per repetition.
fn materialize_order(
    desc: &TimelineDesc,
    rng: &mut RngHandle,
    prev_last: Option<usize>,
) -> Result<Vec<Option<usize>>> {
    let n = desc.timeline_variables.len();
    if n == 0 {
        return Ok(vec![None]);
    }
    let indices: Vec<usize> = (0..n).collect();

    let mut order: Vec<usize> = match &desc.sample {
        SampleSpec::FixedOrder => indices,
        SampleSpec::Shuffle => cadence_rand::shuffle(&indices, rng),
        SampleSpec::ShuffleNoRepeats => {
            // On regeneration after a loop, also reject orders that would
            // repeat the previous iteration's final set across the seam.
            let mut attempts = 0;
            loop {
                let candidate = cadence_rand::shuffle_no_repeats(&indices, |a, b| a == b, rng)?;
                match prev_last {
                    Some(prev) if candidate.first() == Some(&prev) => {
                        attempts += 1;
                        if attempts >= 64 {
                            return Err(CadenceError::Unsatisfiable(
                                "cannot begin a new iteration without repeating the previous \
                                 iteration's final variable set"
                                    .into(),
                            ));
                        }
                    }
                    _ => break candidate,
                }
            }
        }
        SampleSpec::WithReplacement { size, weights } => {
            cadence_rand::sample_with_replacement(&indices, *size, weights.as_deref(), rng)?
        }
        SampleSpec::WithoutReplacement { size } => {
            cadence_rand::sample_without_replacement(&indices, *size, rng)?
        }
        SampleSpec::FixedRepetitions(reps) => cadence_rand::repeat(&indices, *reps, rng),
        SampleSpec::AlternateGroups {
            groups,
            randomize_group_order,
        } => cadence_rand::shuffle_alternate_groups(groups, *randomize_group_order, rng)?,
        SampleSpec::Custom(f) => f(&indices, rng),
    };

    for &i in &order {
        if i >= n {
            return Err(CadenceError::Configuration(format!(
                "sampler produced variable-set index {i}, but only {n} sets exist"
            )));
        }
    }

    if desc.randomize_order {
        order = cadence_rand::shuffle(&order, rng);
    }
    Ok(order.into_iter().map(Some).collect())
}

// ---------------------------------------------------------------------------
// Parameter resolution
// ---------------------------------------------------------------------------

fn resolve_variable<'a>(stack: &'a [Frame], name: &str) -> Option<&'a Value> {
    // Innermost binding wins.
    stack.iter().rev().find_map(|frame| frame.lookup_var(name))
}

fn resolve_param_value(value: &ParamValue, id: &NodeId, stack: &[Frame]) -> Result<Value> {
    match value {
        ParamValue::Value(v) => Ok(v.clone()),
        ParamValue::Computed(f) => Ok(f()),
        ParamValue::Variable(name) => {
            resolve_variable(stack, name)
                .cloned()
                .ok_or_else(|| CadenceError::UnboundVariable {
                    name: name.clone(),
                    node_id: id.to_string(),
                })
        }
    }
}

/// Resolve a trial's parameters: explicit params first, then timeline-level
/// defaults from the enclosing frames, innermost timeline winning.
fn resolve_params(trial: &TrialDesc, id: &NodeId, stack: &[Frame]) -> Result<TrialRecord> {
    let mut params = TrialRecord::new();
    for (name, value) in &trial.params {
        params.insert(name.clone(), resolve_param_value(value, id, stack)?);
    }
    for frame in stack.iter().rev() {
        for (name, value) in &frame.desc.default_params {
            if !params.contains_key(name) {
                params.insert(name.clone(), resolve_param_value(value, id, stack)?);
            }
        }
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Drives one experiment description to completion.
pub struct Executor {
    plugins: PluginRegistry,
    extensions: Arc<ExtensionManager>,
    emitter: EventEmitter,
}

impl Executor {
    pub fn new(plugins: PluginRegistry) -> Self {
        Self {
            plugins,
            extensions: Arc::new(ExtensionManager::new()),
            emitter: EventEmitter::default(),
        }
    }

    pub fn with_extensions(mut self, extensions: ExtensionManager) -> Self {
        self.extensions = Arc::new(extensions);
        self
    }

    /// The run event channel; subscribe before calling
    /// [`run`](Executor::run) to observe the whole run.
    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Execute the experiment. Returns when the final trial's data has been
    /// written, or with the first fatal error.
    pub async fn run(&self, root: &TimelineDesc, mut config: RunConfig) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let run_start = Instant::now();
        let mut rng = RngHandle::seeded(config.seed);
        let seed = rng.seed();
        let mut store = DataStore::new();
        store.attach_emitter(self.emitter.clone());

        let total_trials = naive_trial_count(root);
        tracing::info!(seed, total_trials, mode = ?config.mode, "run started");
        self.emitter.emit(RunEvent::RunStarted {
            seed,
            naive_total_trials: total_trials,
        });

        let result = self
            .drive(root, &mut config, &mut rng, &mut store, run_start)
            .await;

        match result {
            Ok(trials_run) => {
                let duration_ms = run_start.elapsed().as_millis() as u64;
                tracing::info!(trials_run, duration_ms, "run completed");
                self.emitter.emit(RunEvent::RunCompleted {
                    trials_run,
                    duration_ms,
                });
                let data = store.get();
                if let Some(cb) = config.callbacks.on_finish.as_mut() {
                    cb(&data);
                }
                Ok(RunOutcome {
                    data,
                    store,
                    seed,
                    started_at,
                    trials_run,
                })
            }
            Err(err) => {
                tracing::error!(error = %err, "run failed");
                self.emitter.emit(RunEvent::RunFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// The traversal loop proper. Returns the number of trials run.
    async fn drive(
        &self,
        root: &TimelineDesc,
        config: &mut RunConfig,
        rng: &mut RngHandle,
        store: &mut DataStore,
        run_start: Instant,
    ) -> Result<usize> {
        self.extensions.initialize_all().await?;

        let progress_shape = (naive_trial_count(root), naive_timeline_count(root));
        let mut trials_run = 0usize;
        let mut timelines_entered = 0usize;
        let mut stack: Vec<Frame> = Vec::new();

        self.enter_timeline(
            root.clone(),
            NodeId::root(),
            &mut stack,
            store,
            rng,
            &mut timelines_entered,
        )?;

        while let Some(top) = stack.len().checked_sub(1) {
            enum Action {
                RunTrial(TrialDesc, NodeId),
                Enter(TimelineDesc, NodeId),
                EndPass,
            }

            let action = {
                let frame = &stack[top];
                // A sampler may legitimately materialize zero passes
                // (e.g. a size-0 draw); no child runs in that case.
                if frame.pass_idx < frame.pass_order.len()
                    && frame.child_idx < frame.desc.children.len()
                {
                    let child_id = frame.id.child(frame.child_idx, frame.children_iteration);
                    match &frame.desc.children[frame.child_idx] {
                        NodeDesc::Trial(t) => Action::RunTrial(t.clone(), child_id),
                        NodeDesc::Timeline(t) => Action::Enter(t.clone(), child_id),
                    }
                } else {
                    Action::EndPass
                }
            };

            match action {
                Action::RunTrial(trial, id) => {
                    stack[top].child_idx += 1;
                    let progress = Progress {
                        total_trials: progress_shape.0,
                        total_timelines: progress_shape.1,
                        current_trial_global: trials_run + 1,
                        current_trial_local: stack[top].local_trials + 1,
                        current_timeline: timelines_entered,
                    };
                    self.run_trial(
                        trial, id, &stack, config, rng, store, run_start, &mut trials_run, progress,
                    )
                    .await?;
                    stack[top].local_trials += 1;
                    tracing::debug!(
                        trials = trials_run,
                        percent = format!("{:.0}%", progress.percent_complete() * 100.0),
                        "progress"
                    );
                }
                Action::Enter(timeline, id) => {
                    stack[top].child_idx += 1;
                    self.enter_timeline(timeline, id, &mut stack, store, rng, &mut timelines_entered)?;
                }
                Action::EndPass => self.end_pass(&mut stack, store, rng)?,
            }
        }

        Ok(trials_run)
    }

    /// Evaluate a timeline's conditional and, if it passes, push a frame
    /// with its first materialized pass order. A false conditional skips
    /// the node and all descendants without touching the store.
    fn enter_timeline(
        &self,
        desc: TimelineDesc,
        id: NodeId,
        stack: &mut Vec<Frame>,
        store: &DataStore,
        rng: &mut RngHandle,
        timelines_entered: &mut usize,
    ) -> Result<()> {
        if let Some(conditional) = &desc.conditional_fn {
            if !conditional(&store.get()) {
                tracing::debug!(node = %id, "timeline skipped by conditional");
                self.emitter.emit(RunEvent::TimelineSkipped {
                    node_id: id.to_string(),
                });
                return Ok(());
            }
        }

        let pass_order = materialize_order(&desc, rng, None)?;
        *timelines_entered += 1;
        tracing::debug!(node = %id, name = ?desc.name, passes = pass_order.len(), "timeline started");
        self.emitter.emit(RunEvent::TimelineStarted {
            node_id: id.to_string(),
            name: desc.name.clone(),
        });

        stack.push(Frame {
            watermark: store.len(),
            desc,
            id,
            pass_order,
            pass_idx: 0,
            child_idx: 0,
            children_iteration: 0,
            repetition: 0,
            last_set: None,
            local_trials: 0,
            passes_done: 0,
        });
        Ok(())
    }

    /// Advance the top frame past a finished pass: next variable set, next
    /// repetition, loop re-entry, or pop.
    fn end_pass(
        &self,
        stack: &mut Vec<Frame>,
        store: &DataStore,
        rng: &mut RngHandle,
    ) -> Result<()> {
        let frame = stack.last_mut().expect("end_pass with empty stack");

        // An empty materialized order contributes no passes; fall
        // through to the repetition and loop handling directly.
        if frame.pass_idx < frame.pass_order.len() {
            frame.last_set = frame.current_set().or(frame.last_set);
            frame.pass_idx += 1;
            frame.children_iteration += 1;
            frame.child_idx = 0;
            frame.local_trials = 0;
            frame.passes_done += 1;

            if frame.pass_idx < frame.pass_order.len() {
                return Ok(());
            }
        }

        frame.repetition += 1;
        if frame.repetition < frame.desc.repetitions.max(1) {
            frame.pass_order = materialize_order(&frame.desc, rng, frame.last_set)?;
            frame.pass_idx = 0;
            return Ok(());
        }

        // All repetitions done: the loop predicate decides whether the
        // whole node runs again, seeing only this iteration's records.
        let should_loop = match &frame.desc.loop_fn {
            Some(predicate) => predicate(&store.records_since(frame.watermark)),
            None => false,
        };

        if should_loop {
            tracing::debug!(node = %frame.id, pass = frame.passes_done, "timeline looping");
            self.emitter.emit(RunEvent::TimelineLooped {
                node_id: frame.id.to_string(),
                pass: frame.passes_done,
            });
            frame.repetition = 0;
            frame.watermark = store.len();
            frame.pass_order = materialize_order(&frame.desc, rng, frame.last_set)?;
            frame.pass_idx = 0;
        } else {
            tracing::debug!(node = %frame.id, passes = frame.passes_done, "timeline completed");
            self.emitter.emit(RunEvent::TimelineCompleted {
                node_id: frame.id.to_string(),
                passes: frame.passes_done,
            });
            stack.pop();
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_trial(
        &self,
        trial: TrialDesc,
        id: NodeId,
        stack: &[Frame],
        config: &mut RunConfig,
        rng: &mut RngHandle,
        store: &mut DataStore,
        run_start: Instant,
        trials_run: &mut usize,
        progress: Progress,
    ) -> Result<()> {
        let node_id = id.to_string();
        let plugin = self.plugins.get(&trial.plugin, &node_id)?;

        let mut params = resolve_params(&trial, &id, stack)?;
        for required in plugin.required_params() {
            if !params.contains_key(*required) {
                return Err(CadenceError::MissingParameter {
                    param: (*required).to_string(),
                    plugin: trial.plugin.clone(),
                    node_id,
                });
            }
        }

        let trial_index = *trials_run;
        tracing::debug!(node = %id, plugin = %trial.plugin, trial_index, "trial started");
        self.emitter.emit(RunEvent::TrialStarted {
            node_id: node_id.clone(),
            plugin: trial.plugin.clone(),
            trial_index,
            progress,
        });
        if let Some(cb) = config.callbacks.on_trial_start.as_mut() {
            cb(&params);
        }

        let active = self.extensions.resolve(&trial.extensions)?;
        self.extensions.on_start(&active, &mut params)?;

        // The load hook runs from inside the plugin; errors surface through
        // the shared slot once the trial resolves.
        let slot = HookErrorSlot::new();
        let ctx = {
            let manager = self.extensions.clone();
            let active = active.clone();
            let slot = slot.clone();
            TrialContext::new(Box::new(move || {
                if let Err(err) = manager.on_load(&active) {
                    slot.set(err);
                }
            }))
        };

        let trial_start = Instant::now();
        let mut data = match config.mode {
            RunMode::Normal => plugin.trial(&ctx, &params).await,
            RunMode::Simulate(sim_mode) => {
                plugin
                    .simulate(&ctx, &params, sim_mode, &config.simulation_options, rng)
                    .await
            }
        };
        // Guarantee the load hooks observed this trial even if the plugin
        // never signalled.
        ctx.notify_loaded();
        if let Some(err) = slot.take() {
            return Err(err);
        }

        let extension_data = self.extensions.collect_on_finish(&active).await?;
        merge_records(&mut data, &extension_data);

        let mut bookkeeping = TrialRecord::new();
        bookkeeping.insert("trial_type".to_string(), json!(trial.plugin));
        bookkeeping.insert("trial_index".to_string(), json!(trial_index));
        bookkeeping.insert(
            "time_elapsed".to_string(),
            json!(run_start.elapsed().as_millis() as u64),
        );
        bookkeeping.insert("internal_node_id".to_string(), json!(node_id));

        let record = store
            .write(id.clone(), data, trial.data.as_ref(), bookkeeping)
            .clone();
        *trials_run += 1;

        if let Some(cb) = config.callbacks.on_data_update.as_mut() {
            cb(&record);
        }
        if let Some(cb) = config.callbacks.on_trial_finish.as_mut() {
            cb(&record);
        }
        self.emitter.emit(RunEvent::TrialCompleted {
            node_id,
            trial_index,
            duration_ms: trial_start.elapsed().as_millis() as u64,
            progress,
        });

        let gap_ms = params
            .get("post_trial_gap")
            .and_then(Value::as_u64)
            .unwrap_or(config.default_iti_ms);
        let data_only = matches!(config.mode, RunMode::Simulate(SimulationMode::DataOnly));
        if gap_ms > 0 && !data_only {
            tokio::time::sleep(std::time::Duration::from_millis(gap_ms)).await;
        }
        Ok(())
    }
}
