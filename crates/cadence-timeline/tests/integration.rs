//! End-to-end runs through the public API: JSON definitions, nested
//! timelines, looping, extensions, simulation, and export.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_timeline::{
    load_definition, Executor, Extension, ExtensionManager, NodeDesc, Plugin, PluginRegistry,
    RunConfig, RunEvent, SampleSpec, TimelineDesc, TrialContext, TrialDesc,
};
use cadence_types::{
    record_from_value, CadenceError, Result, RunMode, SimulationMode, TrialRecord,
};
use serde_json::json;

/// Deterministic plugin: returns a fixed response so assertions don't
/// depend on synthesis.
struct FixedPlugin;

#[async_trait]
impl Plugin for FixedPlugin {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn trial(&self, ctx: &TrialContext, params: &TrialRecord) -> TrialRecord {
        ctx.notify_loaded();
        let mut data = TrialRecord::new();
        data.insert("rt".to_string(), json!(300));
        if let Some(stimulus) = params.get("stimulus") {
            data.insert("stimulus".to_string(), stimulus.clone());
        }
        data
    }
}

fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    registry.register(Arc::new(FixedPlugin));
    registry
}

fn word_sets(words: &[&str]) -> Vec<TrialRecord> {
    words
        .iter()
        .map(|w| record_from_value(json!({ "word": w })))
        .collect()
}

#[tokio::test]
async fn seeded_randomized_run_is_fully_reproducible() {
    let build = || {
        TimelineDesc::new(vec![TimelineDesc::new(vec![TrialDesc::new("fixed")
            .var_param("stimulus", "word")
            .into()])
        .timeline_variables(word_sets(&["red", "green", "blue"]))
        .randomize_order(true)
        .repetitions(2)
        .into()])
    };

    let first = Executor::new(registry())
        .run(&build(), RunConfig::new().seed(2024))
        .await
        .unwrap();
    let second = Executor::new(registry())
        .run(&build(), RunConfig::new().seed(2024))
        .await
        .unwrap();

    assert_eq!(first.trials_run, 6);
    assert_eq!(first.data.select("stimulus"), second.data.select("stimulus"));
    // Per repetition, each word appears exactly once.
    for half in [first.data.first_n(3), first.data.last_n(3)] {
        let mut words: Vec<String> = half
            .select("stimulus")
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        words.sort();
        assert_eq!(words, vec!["blue", "green", "red"]);
    }
}

#[tokio::test]
async fn loop_predicate_drives_extra_passes() {
    let passes = Arc::new(AtomicUsize::new(0));
    let counter = passes.clone();

    let root = TimelineDesc::new(vec![TimelineDesc::new(vec![TrialDesc::new("fixed")
        .param("stimulus", "again")
        .into()])
    .loop_fn(move |_| counter.fetch_add(1, Ordering::SeqCst) < 2)
    .into()]);

    let outcome = Executor::new(registry())
        .run(&root, RunConfig::new())
        .await
        .unwrap();

    // Loop twice means three passes total.
    assert_eq!(outcome.trials_run, 3);
    assert_eq!(passes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn skipped_timeline_leaves_no_trace_in_the_data() {
    let exec = Executor::new(registry());
    let mut rx = exec.events().subscribe();

    let root = TimelineDesc::new(vec![
        TimelineDesc::new(vec![TrialDesc::new("fixed").param("stimulus", "never").into()])
            .conditional_fn(|_| false)
            .into(),
        TrialDesc::new("fixed").param("stimulus", "always").into(),
    ]);

    let outcome = exec.run(&root, RunConfig::new()).await.unwrap();
    assert_eq!(outcome.trials_run, 1);
    assert_eq!(outcome.data.select("stimulus"), vec![json!("always")]);

    let mut skipped = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, RunEvent::TimelineSkipped { .. }) {
            skipped += 1;
        }
    }
    assert_eq!(skipped, 1);
}

#[tokio::test]
async fn last_timeline_data_is_scoped_to_the_enclosing_timeline() {
    // Two sibling timelines; a conditional on the second queries data from
    // the store mid-run, and after the run the store answers
    // timeline-scoped questions.
    let block = |label: &str, n: usize| {
        let trials: Vec<NodeDesc> = (0..n)
            .map(|i| {
                TrialDesc::new("fixed")
                    .param("stimulus", format!("{label}{i}"))
                    .into()
            })
            .collect();
        TimelineDesc::new(trials)
    };

    let root = TimelineDesc::new(vec![block("a", 3).into(), block("b", 2).into()]);
    let outcome = Executor::new(registry())
        .run(&root, RunConfig::new())
        .await
        .unwrap();

    let last = outcome.store.get_last_timeline_data();
    assert_eq!(last.count(), 2);
    assert_eq!(last.select("stimulus"), vec![json!("b0"), json!("b1")]);
}

#[tokio::test]
async fn data_only_simulation_covers_the_whole_design() {
    let source = r#"{
        "timeline": [
            {"type": "echo", "stimulus": "welcome"},
            {
                "timeline": [
                    {"type": "echo",
                     "stimulus": {"timeline_variable": "word"},
                     "choices": ["f", "j"]}
                ],
                "timeline_variables": [
                    {"word": "cat"}, {"word": "dog"}, {"word": "fox"}
                ],
                "sample": {"type": "fixed-repetitions", "size": 2}
            }
        ]
    }"#;
    let root = load_definition(source).unwrap();

    let outcome = Executor::new(registry())
        .run(
            &root,
            RunConfig::new()
                .mode(RunMode::Simulate(SimulationMode::DataOnly))
                .seed(77),
        )
        .await
        .unwrap();

    // 1 welcome + 3 words × 2 repetitions.
    assert_eq!(outcome.trials_run, 7);
    for record in outcome.data.iter() {
        assert!(record["rt"].as_f64().unwrap() >= 0.0);
    }
    let responses: Vec<_> = outcome.data.last_n(6).select("response");
    for r in responses {
        assert!(r == json!("f") || r == json!("j"));
    }
    // Simulated echo trials still carry their stimulus.
    assert_eq!(outcome.data.first().unwrap()["stimulus"], json!("welcome"));
    for stimulus in outcome.data.last_n(6).select("stimulus") {
        assert!(["cat", "dog", "fox"].iter().any(|w| stimulus == json!(w)));
    }
}

struct GazeExtension {
    samples: Mutex<Vec<u64>>,
    fail_on_finish: bool,
}

#[async_trait]
impl Extension for GazeExtension {
    fn name(&self) -> &str {
        "gaze"
    }

    fn on_load(&self) -> Result<()> {
        self.samples.lock().unwrap().push(42);
        Ok(())
    }

    async fn on_finish(&self) -> Result<TrialRecord> {
        if self.fail_on_finish {
            return Err(CadenceError::Configuration("camera lost".into()));
        }
        let samples = std::mem::take(&mut *self.samples.lock().unwrap());
        let mut data = TrialRecord::new();
        data.insert("samples".to_string(), json!(samples));
        Ok(data)
    }
}

#[tokio::test]
async fn extension_data_lands_namespaced_on_the_trial_record() {
    let mut extensions = ExtensionManager::new();
    extensions.register(
        Arc::new(GazeExtension {
            samples: Mutex::new(Vec::new()),
            fail_on_finish: false,
        }),
        TrialRecord::new(),
    );

    let root = TimelineDesc::new(vec![
        TrialDesc::new("fixed")
            .param("stimulus", "watched")
            .extensions(["gaze"])
            .into(),
        TrialDesc::new("fixed").param("stimulus", "unwatched").into(),
    ]);

    let outcome = Executor::new(registry())
        .with_extensions(extensions)
        .run(&root, RunConfig::new())
        .await
        .unwrap();

    let records = outcome.data.records();
    assert_eq!(records[0]["gaze_samples"], json!([42]));
    assert!(records[1].get("gaze_samples").is_none());
}

#[tokio::test]
async fn extension_failure_aborts_the_run() {
    let mut extensions = ExtensionManager::new();
    extensions.register(
        Arc::new(GazeExtension {
            samples: Mutex::new(Vec::new()),
            fail_on_finish: true,
        }),
        TrialRecord::new(),
    );

    let root = TimelineDesc::new(vec![TrialDesc::new("fixed")
        .param("stimulus", "watched")
        .extensions(["gaze"])
        .into()]);

    let err = Executor::new(registry())
        .with_extensions(extensions)
        .run(&root, RunConfig::new())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "extension 'gaze' failed in on_finish: configuration error: camera lost"
    );
}

#[tokio::test]
async fn unbound_variable_fails_with_the_node_path() {
    let root = TimelineDesc::new(vec![TimelineDesc::new(vec![TrialDesc::new("fixed")
        .var_param("stimulus", "nope")
        .into()])
    .timeline_variables(word_sets(&["only-word"]))
    .into()]);

    let err = Executor::new(registry())
        .run(&root, RunConfig::new())
        .await
        .unwrap_err();
    match err {
        CadenceError::UnboundVariable { name, node_id } => {
            assert_eq!(name, "nope");
            assert_eq!(node_id, "0.0-0.0");
        }
        other => panic!("expected UnboundVariable, got {other}"),
    }
}

#[tokio::test]
async fn exported_csv_matches_the_run_data() {
    let root = load_definition(
        r#"[{"type": "fixed", "stimulus": "one"},
            {"type": "fixed", "stimulus": "two"}]"#,
    )
    .unwrap();

    let outcome = Executor::new(registry())
        .run(&root, RunConfig::new().seed(3))
        .await
        .unwrap();

    let csv = outcome.data.csv();
    let lines: Vec<&str> = csv.split("\r\n").filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 3);
    // Header carries the bookkeeping columns.
    for column in ["trial_type", "trial_index", "time_elapsed", "internal_node_id"] {
        assert!(lines[0].contains(&format!("\"{column}\"")), "{csv}");
    }
    assert!(lines[1].contains("\"one\""));
    assert!(lines[2].contains("\"two\""));

    let parsed: Vec<TrialRecord> =
        serde_json::from_str(&outcome.data.json(false).unwrap()).unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0]["stimulus"], json!("one"));
}

#[tokio::test]
async fn alternate_groups_interleave_variable_sets() {
    let root = TimelineDesc::new(vec![TimelineDesc::new(vec![TrialDesc::new("fixed")
        .var_param("stimulus", "word")
        .into()])
    .timeline_variables(word_sets(&["a1", "a2", "b1", "b2"]))
    .sample(SampleSpec::AlternateGroups {
        groups: vec![vec![0, 1], vec![2, 3]],
        randomize_group_order: false,
    })
    .into()]);

    let outcome = Executor::new(registry())
        .run(&root, RunConfig::new().seed(8))
        .await
        .unwrap();

    let stimuli: Vec<String> = outcome
        .data
        .select("stimulus")
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(stimuli.len(), 4);
    // Groups alternate position-wise: a-group words at even positions.
    for (i, word) in stimuli.iter().enumerate() {
        let expected_group = if i % 2 == 0 { 'a' } else { 'b' };
        assert!(word.starts_with(expected_group), "unexpected order {stimuli:?}");
    }
}
