//! JSON experiment definitions.
//!
//! The code-level builders in [`crate::node`] are the primary interface;
//! this module adds a declarative JSON form for the CLI and for embedders
//! that load experiments from files. Trials are objects with a `type` key,
//! timelines are objects with a `timeline` key, and
//! `{"timeline_variable": "name"}` marks a parameter resolved against the
//! active variable set. Loop and conditional predicates, computed
//! parameters, and custom samplers are code-only and cannot be expressed
//! in JSON.

use cadence_types::{CadenceError, Result, TrialRecord};
use serde_json::Value;

use crate::node::{NodeDesc, ParamValue, SampleSpec, TimelineDesc, TrialDesc};
use crate::plugin::PluginRegistry;

/// Keys with structural meaning on a trial object; everything else becomes
/// a plugin parameter.
const TRIAL_RESERVED: &[&str] = &["type", "data", "extensions"];

/// Keys with structural meaning on a timeline object; everything else
/// becomes a timeline-level default parameter.
const TIMELINE_RESERVED: &[&str] = &[
    "timeline",
    "timeline_variables",
    "sample",
    "randomize_order",
    "repetitions",
    "name",
];

/// Parse a JSON definition into a runnable description. The top level may
/// be a timeline object or a bare array of nodes.
pub fn load_definition(source: &str) -> Result<TimelineDesc> {
    let value: Value = serde_json::from_str(source)?;
    match value {
        Value::Array(children) => {
            let children = parse_children(&children, "$")?;
            Ok(TimelineDesc::new(children))
        }
        Value::Object(_) => match parse_node(&value, "$")? {
            NodeDesc::Timeline(desc) => Ok(desc),
            NodeDesc::Trial(trial) => Ok(TimelineDesc::new(vec![trial.into()])),
        },
        other => Err(config_at(
            "$",
            format!("expected an object or array, found {}", kind_name(&other)),
        )),
    }
}

fn parse_children(children: &[Value], path: &str) -> Result<Vec<NodeDesc>> {
    children
        .iter()
        .enumerate()
        .map(|(i, child)| parse_node(child, &format!("{path}.timeline[{i}]")))
        .collect()
}

fn parse_node(value: &Value, path: &str) -> Result<NodeDesc> {
    let obj = value
        .as_object()
        .ok_or_else(|| config_at(path, format!("expected an object, found {}", kind_name(value))))?;

    match (obj.contains_key("timeline"), obj.contains_key("type")) {
        (true, false) => Ok(parse_timeline(obj, path)?.into()),
        (false, true) => Ok(parse_trial(obj, path)?.into()),
        (true, true) => Err(config_at(path, "a node cannot have both 'timeline' and 'type'")),
        (false, false) => Err(config_at(
            path,
            "a node needs either 'timeline' (timeline) or 'type' (trial)",
        )),
    }
}

fn parse_trial(obj: &TrialRecord, path: &str) -> Result<TrialDesc> {
    let plugin = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| config_at(path, "'type' must be a plugin name string"))?;

    let mut trial = TrialDesc::new(plugin);

    if let Some(data) = obj.get("data") {
        let record = data
            .as_object()
            .ok_or_else(|| config_at(&format!("{path}.data"), "'data' must be an object"))?;
        trial.data = Some(record.clone());
    }

    if let Some(extensions) = obj.get("extensions") {
        let names = extensions
            .as_array()
            .ok_or_else(|| {
                config_at(
                    &format!("{path}.extensions"),
                    "'extensions' must be an array of names",
                )
            })?
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    config_at(
                        &format!("{path}.extensions"),
                        "'extensions' entries must be strings",
                    )
                })
            })
            .collect::<Result<Vec<String>>>()?;
        trial.extensions = names;
    }

    for (key, value) in obj {
        if TRIAL_RESERVED.contains(&key.as_str()) {
            continue;
        }
        trial.params.insert(key.clone(), parse_param(value));
    }
    Ok(trial)
}

fn parse_timeline(obj: &TrialRecord, path: &str) -> Result<TimelineDesc> {
    let children = obj
        .get("timeline")
        .and_then(Value::as_array)
        .ok_or_else(|| config_at(path, "'timeline' must be an array of nodes"))?;
    let mut desc = TimelineDesc::new(parse_children(children, path)?);

    if let Some(sets) = obj.get("timeline_variables") {
        let sets = sets
            .as_array()
            .ok_or_else(|| {
                config_at(
                    &format!("{path}.timeline_variables"),
                    "'timeline_variables' must be an array of objects",
                )
            })?
            .iter()
            .map(|set| {
                set.as_object().cloned().ok_or_else(|| {
                    config_at(
                        &format!("{path}.timeline_variables"),
                        "each variable set must be an object",
                    )
                })
            })
            .collect::<Result<Vec<TrialRecord>>>()?;
        desc.timeline_variables = sets;
    }

    if let Some(sample) = obj.get("sample") {
        desc.sample = parse_sample(sample, &format!("{path}.sample"))?;
    }

    if let Some(randomize) = obj.get("randomize_order") {
        desc.randomize_order = randomize
            .as_bool()
            .ok_or_else(|| config_at(path, "'randomize_order' must be a boolean"))?;
    }

    if let Some(repetitions) = obj.get("repetitions") {
        desc.repetitions = repetitions
            .as_u64()
            .ok_or_else(|| config_at(path, "'repetitions' must be a non-negative integer"))?
            as usize;
    }

    if let Some(name) = obj.get("name") {
        desc.name = Some(
            name.as_str()
                .ok_or_else(|| config_at(path, "'name' must be a string"))?
                .to_string(),
        );
    }

    for (key, value) in obj {
        if TIMELINE_RESERVED.contains(&key.as_str()) {
            continue;
        }
        desc.default_params.insert(key.clone(), parse_param(value));
    }
    Ok(desc)
}

/// A one-key `{"timeline_variable": name}` object is a variable reference;
/// any other value is taken literally.
fn parse_param(value: &Value) -> ParamValue {
    if let Some(obj) = value.as_object() {
        if obj.len() == 1 {
            if let Some(name) = obj.get("timeline_variable").and_then(Value::as_str) {
                return ParamValue::Variable(name.to_string());
            }
        }
    }
    ParamValue::Value(value.clone())
}

fn parse_sample(value: &Value, path: &str) -> Result<SampleSpec> {
    let obj = value
        .as_object()
        .ok_or_else(|| config_at(path, "'sample' must be an object with a 'type'"))?;
    let sample_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| config_at(path, "'sample.type' must be a string"))?;

    let size = |field: &str| -> Result<usize> {
        obj.get(field)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| {
                config_at(
                    path,
                    format!("sample type '{sample_type}' requires a '{field}' integer"),
                )
            })
    };

    match sample_type {
        "shuffle" => Ok(SampleSpec::Shuffle),
        "shuffle-no-repeats" => Ok(SampleSpec::ShuffleNoRepeats),
        "with-replacement" => {
            let weights = match obj.get("weights") {
                None => None,
                Some(weights) => Some(
                    weights
                        .as_array()
                        .ok_or_else(|| config_at(path, "'weights' must be an array of numbers"))?
                        .iter()
                        .map(|w| {
                            w.as_f64().ok_or_else(|| {
                                config_at(path, "'weights' entries must be numbers")
                            })
                        })
                        .collect::<Result<Vec<f64>>>()?,
                ),
            };
            Ok(SampleSpec::WithReplacement {
                size: size("size")?,
                weights,
            })
        }
        "without-replacement" => Ok(SampleSpec::WithoutReplacement { size: size("size")? }),
        "fixed-repetitions" => Ok(SampleSpec::FixedRepetitions(size("size")?)),
        "alternate-groups" => {
            let groups = obj
                .get("groups")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    config_at(path, "sample type 'alternate-groups' requires a 'groups' array")
                })?
                .iter()
                .map(|group| {
                    group
                        .as_array()
                        .ok_or_else(|| config_at(path, "each group must be an array of indices"))?
                        .iter()
                        .map(|i| {
                            i.as_u64().map(|i| i as usize).ok_or_else(|| {
                                config_at(path, "group entries must be variable-set indices")
                            })
                        })
                        .collect::<Result<Vec<usize>>>()
                })
                .collect::<Result<Vec<Vec<usize>>>>()?;
            let randomize_group_order = obj
                .get("randomize_group_order")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(SampleSpec::AlternateGroups {
                groups,
                randomize_group_order,
            })
        }
        "custom" => Err(config_at(
            path,
            "custom samplers cannot be expressed in JSON; use the code-level builder",
        )),
        other => Err(config_at(path, format!("unknown sample type '{other}'"))),
    }
}

fn config_at(path: &str, message: impl Into<String>) -> CadenceError {
    CadenceError::Configuration(format!("{} (at {})", message.into(), path))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One finding from [`validate`].
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{tag}: {} (at {})", self.message, self.path)
    }
}

/// Structural checks beyond what parsing enforces. With a registry, also
/// flags trials referencing unregistered plugins.
pub fn validate(desc: &TimelineDesc, plugins: Option<&PluginRegistry>) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_timeline(desc, "$", plugins, &mut diagnostics);
    diagnostics
}

fn validate_timeline(
    desc: &TimelineDesc,
    path: &str,
    plugins: Option<&PluginRegistry>,
    out: &mut Vec<Diagnostic>,
) {
    if desc.children.is_empty() {
        out.push(Diagnostic {
            severity: Severity::Warning,
            path: path.to_string(),
            message: "timeline has no children and will produce no data".into(),
        });
    }
    if desc.repetitions == 0 {
        out.push(Diagnostic {
            severity: Severity::Warning,
            path: path.to_string(),
            message: "repetitions is 0; the timeline still runs once".into(),
        });
    }

    let set_count = desc.timeline_variables.len();
    match &desc.sample {
        SampleSpec::WithReplacement {
            weights: Some(weights),
            ..
        } if weights.len() != set_count => out.push(Diagnostic {
            severity: Severity::Error,
            path: path.to_string(),
            message: format!(
                "weight vector length {} does not match the {} variable sets",
                weights.len(),
                set_count
            ),
        }),
        SampleSpec::WithoutReplacement { size } if *size > set_count => out.push(Diagnostic {
            severity: Severity::Error,
            path: path.to_string(),
            message: format!(
                "cannot draw {size} sets without replacement from {set_count}"
            ),
        }),
        SampleSpec::AlternateGroups { groups, .. } => {
            if groups.iter().any(|g| g.len() != groups[0].len()) {
                out.push(Diagnostic {
                    severity: Severity::Error,
                    path: path.to_string(),
                    message: "alternate groups must all have the same length".into(),
                });
            }
            if let Some(&bad) = groups.iter().flatten().find(|&&i| i >= set_count) {
                out.push(Diagnostic {
                    severity: Severity::Error,
                    path: path.to_string(),
                    message: format!(
                        "group references variable-set index {bad}, but only {set_count} sets exist"
                    ),
                });
            }
        }
        _ => {}
    }

    if set_count == 0 && !matches!(desc.sample, SampleSpec::FixedOrder) {
        out.push(Diagnostic {
            severity: Severity::Warning,
            path: path.to_string(),
            message: "a sample specification has no effect without timeline variables".into(),
        });
    }

    for (i, child) in desc.children.iter().enumerate() {
        let child_path = format!("{path}.timeline[{i}]");
        match child {
            NodeDesc::Timeline(t) => validate_timeline(t, &child_path, plugins, out),
            NodeDesc::Trial(t) => {
                if let Some(registry) = plugins {
                    if !registry.has(&t.plugin) {
                        out.push(Diagnostic {
                            severity: Severity::Error,
                            path: child_path,
                            message: format!("no plugin registered under name '{}'", t.plugin),
                        });
                    }
                }
            }
        }
    }
}
