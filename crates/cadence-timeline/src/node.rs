//! The declarative node model: trial and timeline descriptions, parameter
//! values, sampling specifications, and per-run node identifiers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cadence_rand::RngHandle;
use cadence_types::TrialRecord;
use serde_json::Value;

use crate::data::DataCollection;

/// A parameter value computed at resolution time.
pub type ComputedFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Loop predicate: receives the results produced during the just-completed
/// iteration and returns whether to repeat the entire child sequence.
pub type LoopFn = Arc<dyn Fn(&DataCollection) -> bool + Send + Sync>;

/// Conditional predicate: evaluated once before entering a timeline, against
/// a snapshot of the full data store. Returning `false` skips the node and
/// all of its descendants.
pub type ConditionalFn = Arc<dyn Fn(&DataCollection) -> bool + Send + Sync>;

/// Custom sampler: maps the variable-set indices to the order of passes.
pub type SampleFn = Arc<dyn Fn(&[usize], &mut RngHandle) -> Vec<usize> + Send + Sync>;

// ---------------------------------------------------------------------------
// ParamValue
// ---------------------------------------------------------------------------

/// A trial parameter: a plain value, a timeline-variable reference resolved
/// against the active pass, or a closure evaluated at resolution time.
#[derive(Clone)]
pub enum ParamValue {
    Value(Value),
    Variable(String),
    Computed(ComputedFn),
}

impl fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Value(v) => write!(f, "Value({v})"),
            ParamValue::Variable(name) => write!(f, "Variable({name:?})"),
            ParamValue::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        ParamValue::Value(value)
    }
}

// ---------------------------------------------------------------------------
// Node descriptions
// ---------------------------------------------------------------------------

/// A node in the declarative experiment tree.
#[derive(Debug, Clone)]
pub enum NodeDesc {
    Trial(TrialDesc),
    Timeline(TimelineDesc),
}

impl From<TrialDesc> for NodeDesc {
    fn from(desc: TrialDesc) -> Self {
        NodeDesc::Trial(desc)
    }
}

impl From<TimelineDesc> for NodeDesc {
    fn from(desc: TimelineDesc) -> Self {
        NodeDesc::Timeline(desc)
    }
}

/// A leaf node: one invocation of a named plugin.
#[derive(Debug, Clone)]
pub struct TrialDesc {
    pub plugin: String,
    pub params: HashMap<String, ParamValue>,
    /// Static record merged into this trial's result (after plugin data).
    pub data: Option<TrialRecord>,
    /// Names of extensions active for this trial.
    pub extensions: Vec<String>,
}

impl TrialDesc {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            params: HashMap::new(),
            data: None,
            extensions: Vec::new(),
        }
    }

    /// Set a plain parameter value.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), ParamValue::Value(value.into()));
        self
    }

    /// Set a parameter to a timeline-variable reference.
    pub fn var_param(mut self, name: impl Into<String>, variable: impl Into<String>) -> Self {
        self.params
            .insert(name.into(), ParamValue::Variable(variable.into()));
        self
    }

    /// Set a parameter computed by a closure at resolution time.
    pub fn computed_param<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.params
            .insert(name.into(), ParamValue::Computed(Arc::new(f)));
        self
    }

    pub fn data(mut self, data: TrialRecord) -> Self {
        self.data = Some(data);
        self
    }

    pub fn extensions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = names.into_iter().map(Into::into).collect();
        self
    }
}

/// A composite node: an ordered child sequence with optional variable sets,
/// sampling, looping, and conditional behavior.
#[derive(Clone, Default)]
pub struct TimelineDesc {
    pub children: Vec<NodeDesc>,
    /// One pass of the children is executed per set, in the order produced
    /// by the sampling specification.
    pub timeline_variables: Vec<TrialRecord>,
    pub sample: SampleSpec,
    /// Shuffle the materialized pass order after sampling.
    pub randomize_order: bool,
    pub loop_fn: Option<LoopFn>,
    pub conditional_fn: Option<ConditionalFn>,
    /// Number of times the whole node runs, independent of any loop predicate.
    pub repetitions: usize,
    pub name: Option<String>,
    /// Parameters inherited by descendant trials that don't set them.
    pub default_params: HashMap<String, ParamValue>,
}

impl fmt::Debug for TimelineDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineDesc")
            .field("children", &self.children.len())
            .field("timeline_variables", &self.timeline_variables.len())
            .field("sample", &self.sample)
            .field("randomize_order", &self.randomize_order)
            .field("has_loop_fn", &self.loop_fn.is_some())
            .field("has_conditional_fn", &self.conditional_fn.is_some())
            .field("repetitions", &self.repetitions)
            .field("name", &self.name)
            .finish()
    }
}

impl TimelineDesc {
    pub fn new(children: Vec<NodeDesc>) -> Self {
        Self {
            children,
            repetitions: 1,
            ..Default::default()
        }
    }

    pub fn timeline_variables(mut self, sets: Vec<TrialRecord>) -> Self {
        self.timeline_variables = sets;
        self
    }

    pub fn sample(mut self, spec: SampleSpec) -> Self {
        self.sample = spec;
        self
    }

    pub fn randomize_order(mut self, randomize: bool) -> Self {
        self.randomize_order = randomize;
        self
    }

    pub fn loop_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&DataCollection) -> bool + Send + Sync + 'static,
    {
        self.loop_fn = Some(Arc::new(f));
        self
    }

    pub fn conditional_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&DataCollection) -> bool + Send + Sync + 'static,
    {
        self.conditional_fn = Some(Arc::new(f));
        self
    }

    pub fn repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set a default parameter inherited by descendant trials.
    pub fn default_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.default_params.insert(name.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Sampling specification
// ---------------------------------------------------------------------------

/// How timeline-variable-set passes are ordered and repeated.
#[derive(Clone, Default)]
pub enum SampleSpec {
    /// Array order, one pass per set.
    #[default]
    FixedOrder,
    /// Full random permutation of the set list.
    Shuffle,
    /// Random permutation with no set appearing twice in a row; when the
    /// timeline repeats via a loop predicate, the regenerated order also
    /// avoids repeating the previous iteration's final set at the seam.
    ShuffleNoRepeats,
    /// `size` draws with replacement, optionally weighted.
    WithReplacement { size: usize, weights: Option<Vec<f64>> },
    /// `size` distinct draws.
    WithoutReplacement { size: usize },
    /// Every set `reps` times, shuffled.
    FixedRepetitions(usize),
    /// Interleave pre-assigned groups of set indices position-wise.
    AlternateGroups {
        groups: Vec<Vec<usize>>,
        randomize_group_order: bool,
    },
    /// User-supplied ordering function over the set indices.
    Custom(SampleFn),
}

impl fmt::Debug for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleSpec::FixedOrder => write!(f, "FixedOrder"),
            SampleSpec::Shuffle => write!(f, "Shuffle"),
            SampleSpec::ShuffleNoRepeats => write!(f, "ShuffleNoRepeats"),
            SampleSpec::WithReplacement { size, weights } => f
                .debug_struct("WithReplacement")
                .field("size", size)
                .field("weights", weights)
                .finish(),
            SampleSpec::WithoutReplacement { size } => f
                .debug_struct("WithoutReplacement")
                .field("size", size)
                .finish(),
            SampleSpec::FixedRepetitions(reps) => write!(f, "FixedRepetitions({reps})"),
            SampleSpec::AlternateGroups {
                groups,
                randomize_group_order,
            } => f
                .debug_struct("AlternateGroups")
                .field("groups", groups)
                .field("randomize_group_order", randomize_group_order)
                .finish(),
            SampleSpec::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeId — per-run path identifying a node instance
// ---------------------------------------------------------------------------

/// A path-like identifier assigned to every node instance at traversal time:
/// one `(child_index, iteration)` segment per level below the root. Unique
/// per execution, stable within one run; renders as e.g. `"0.0-1.2"`.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct NodeId {
    segments: Vec<(usize, usize)>,
}

impl NodeId {
    /// The root timeline's id (empty path).
    pub fn root() -> Self {
        Self::default()
    }

    /// The id of a child instance at `child_index`, on the parent's
    /// `iteration`-th pass through its children.
    pub fn child(&self, child_index: usize, iteration: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push((child_index, iteration));
        Self { segments }
    }

    /// The id of the enclosing timeline instance, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Whether `self` is `ancestor` or lies beneath it.
    pub fn is_descendant_of(&self, ancestor: &NodeId) -> bool {
        self.segments.len() >= ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .segments
            .iter()
            .map(|(index, iteration)| format!("{index}.{iteration}"))
            .collect();
        write!(f, "{}", rendered.join("-"))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

// ---------------------------------------------------------------------------
// Naive shape counts
// ---------------------------------------------------------------------------

/// Naive number of trials a timeline describes: children × repetitions ×
/// variable-set count, ignoring loop and conditional predicates (which
/// cannot be accounted for ahead of time).
pub fn naive_trial_count(desc: &TimelineDesc) -> usize {
    let per_pass: usize = desc
        .children
        .iter()
        .map(|child| match child {
            NodeDesc::Trial(_) => 1,
            NodeDesc::Timeline(t) => naive_trial_count(t),
        })
        .sum();
    per_pass * desc.repetitions.max(1) * desc.timeline_variables.len().max(1)
}

/// Number of timeline nodes in the description, the root included.
pub fn naive_timeline_count(desc: &TimelineDesc) -> usize {
    1 + desc
        .children
        .iter()
        .map(|child| match child {
            NodeDesc::Trial(_) => 0,
            NodeDesc::Timeline(t) => naive_timeline_count(t),
        })
        .sum::<usize>()
}
