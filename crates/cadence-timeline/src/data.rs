//! Hierarchical result recording, querying, and export.
//!
//! The store is append-only: trial results are written in completion order
//! (which, with a single outstanding trial, equals presentation order) and
//! never deleted during a run. A parallel side table maps each record's
//! sequence position to the [`NodeId`] that produced it, so queries like
//! "all data from the timeline containing the most recent trial" resolve
//! without re-walking the node tree.

use cadence_types::{merge_records, Result, TrialRecord};
use serde::{Deserialize, Serialize};

use crate::events::{EventEmitter, RunEvent};
use crate::node::NodeId;

// ---------------------------------------------------------------------------
// Interaction records
// ---------------------------------------------------------------------------

/// Out-of-band participant-environment events, kept for audit alongside but
/// separate from experimental data. Embedders record these; the engine does
/// not fabricate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionEvent {
    Blur,
    Focus,
    FullscreenEnter,
    FullscreenExit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub event: InteractionEvent,
    /// Global index of the trial in progress when the event occurred.
    pub trial: usize,
    /// Milliseconds of elapsed run time.
    pub time: u64,
}

// ---------------------------------------------------------------------------
// DataStore
// ---------------------------------------------------------------------------

/// The run-scoped result store.
#[derive(Clone, Default)]
pub struct DataStore {
    records: Vec<TrialRecord>,
    /// Side table: `producers[i]` is the node instance that produced
    /// `records[i]`.
    producers: Vec<NodeId>,
    interactions: Vec<InteractionRecord>,
    /// Globally-registered properties appended to every record.
    properties: TrialRecord,
    /// When attached, interaction recordings are mirrored onto the run
    /// event channel.
    emitter: Option<EventEmitter>,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("records", &self.records)
            .field("producers", &self.producers)
            .field("interactions", &self.interactions)
            .field("properties", &self.properties)
            .finish()
    }
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one trial result. Merge precedence, later wins: plugin data →
    /// node-level static data → globally-registered properties → internal
    /// bookkeeping fields. Returns a reference to the stored record.
    pub fn write(
        &mut self,
        producer: NodeId,
        plugin_data: TrialRecord,
        node_data: Option<&TrialRecord>,
        bookkeeping: TrialRecord,
    ) -> &TrialRecord {
        let mut record = plugin_data;
        if let Some(node_data) = node_data {
            merge_records(&mut record, node_data);
        }
        merge_records(&mut record, &self.properties);
        merge_records(&mut record, &bookkeeping);

        self.records.push(record);
        self.producers.push(producer);
        self.records.last().unwrap()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Deep-copied snapshot of all records, in write order.
    pub fn get(&self) -> DataCollection {
        DataCollection::new(self.records.clone())
    }

    /// Deep-copied snapshot of the interaction records.
    pub fn get_interaction_data(&self) -> Vec<InteractionRecord> {
        self.interactions.clone()
    }

    pub fn record_interaction(&mut self, event: InteractionEvent, trial: usize, time: u64) {
        self.interactions.push(InteractionRecord { event, trial, time });
        if let Some(emitter) = &self.emitter {
            emitter.emit(RunEvent::InteractionRecorded { event, trial, time });
        }
    }

    /// Mirror future interaction recordings onto `emitter`.
    pub fn attach_emitter(&mut self, emitter: EventEmitter) {
        self.emitter = Some(emitter);
    }

    /// Merge `props` into every stored record and into all future writes.
    pub fn add_properties(&mut self, props: &TrialRecord) {
        self.add_to_all(props);
        merge_records(&mut self.properties, props);
    }

    /// Merge `props` into every stored record.
    pub fn add_to_all(&mut self, props: &TrialRecord) {
        for record in &mut self.records {
            merge_records(record, props);
        }
    }

    /// Merge `props` into the most recently written record, if any.
    pub fn add_to_last(&mut self, props: &TrialRecord) {
        if let Some(last) = self.records.last_mut() {
            merge_records(last, props);
        }
    }

    /// All records produced by `node` or any node beneath it.
    pub fn get_data_by_node(&self, node: &NodeId) -> DataCollection {
        let records = self
            .records
            .iter()
            .zip(&self.producers)
            .filter(|(_, producer)| producer.is_descendant_of(node))
            .map(|(record, _)| record.clone())
            .collect();
        DataCollection::new(records)
    }

    /// All records ever produced by the timeline enclosing the most recent
    /// trial — not just its current pass. Empty when nothing was written.
    pub fn get_last_timeline_data(&self) -> DataCollection {
        let Some(last_producer) = self.producers.last() else {
            return DataCollection::default();
        };
        match last_producer.parent() {
            Some(parent) => self.get_data_by_node(&parent),
            None => DataCollection::default(),
        }
    }

    /// Snapshot of the records written at or after `watermark` (a previous
    /// value of [`len`](DataStore::len)). Used for loop-predicate scoping.
    pub fn records_since(&self, watermark: usize) -> DataCollection {
        DataCollection::new(self.records[watermark.min(self.records.len())..].to_vec())
    }
}

// ---------------------------------------------------------------------------
// DataCollection — an owned, queryable snapshot
// ---------------------------------------------------------------------------

/// An immutable snapshot of trial records. All accessors return copies;
/// callers cannot mutate stored history through a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataCollection {
    records: Vec<TrialRecord>,
}

impl DataCollection {
    pub fn new(records: Vec<TrialRecord>) -> Self {
        Self { records }
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrialRecord> {
        self.records.iter()
    }

    pub fn first(&self) -> Option<&TrialRecord> {
        self.records.first()
    }

    pub fn last(&self) -> Option<&TrialRecord> {
        self.records.last()
    }

    /// The first `n` records (fewer when the collection is smaller).
    pub fn first_n(&self, n: usize) -> DataCollection {
        DataCollection::new(self.records[..n.min(self.records.len())].to_vec())
    }

    /// The last `n` records (fewer when the collection is smaller).
    pub fn last_n(&self, n: usize) -> DataCollection {
        let start = self.records.len().saturating_sub(n);
        DataCollection::new(self.records[start..].to_vec())
    }

    /// Records whose `key` equals `value`.
    pub fn filter(&self, key: &str, value: &serde_json::Value) -> DataCollection {
        self.filter_custom(|record| record.get(key) == Some(value))
    }

    /// Records matching an arbitrary predicate.
    pub fn filter_custom<F>(&self, predicate: F) -> DataCollection
    where
        F: Fn(&TrialRecord) -> bool,
    {
        DataCollection::new(
            self.records
                .iter()
                .filter(|record| predicate(record))
                .cloned()
                .collect(),
        )
    }

    /// The values stored under `key`, in record order; missing keys yield
    /// `null` so positions stay aligned with the records.
    pub fn select(&self, key: &str) -> Vec<serde_json::Value> {
        self.records
            .iter()
            .map(|record| record.get(key).cloned().unwrap_or(serde_json::Value::Null))
            .collect()
    }

    /// JSON export: an array of result records. Pretty output indents with
    /// tabs.
    pub fn json(&self, pretty: bool) -> Result<String> {
        if !pretty {
            return Ok(serde_json::to_string(&self.records)?);
        }
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.records.serialize(&mut serializer)?;
        Ok(String::from_utf8(buf).expect("serde_json emits UTF-8"))
    }

    /// CSV export. Bit-exact contract relied on by downstream analysis
    /// tools: the column set is the union of keys across all rows in
    /// first-seen order; every field is quoted, with embedded quotes
    /// doubled; nested records and arrays serialize as their JSON text
    /// inside the quoted field; lines end with CRLF; a missing field
    /// serializes empty.
    pub fn csv(&self) -> String {
        let mut columns: Vec<&str> = Vec::new();
        for record in &self.records {
            for key in record.keys() {
                if !columns.contains(&key.as_str()) {
                    columns.push(key);
                }
            }
        }

        let mut out = String::new();
        let header: Vec<String> = columns.iter().map(|c| csv_field(c)).collect();
        out.push_str(&header.join(","));
        out.push_str("\r\n");

        for record in &self.records {
            let fields: Vec<String> = columns
                .iter()
                .map(|col| csv_field(&cell_text(record.get(*col))))
                .collect();
            out.push_str(&fields.join(","));
            out.push_str("\r\n");
        }
        out
    }
}

/// Quote a CSV field, doubling embedded quotes.
fn csv_field(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Text form of one cell: absent → empty, strings unwrapped, scalars via
/// their JSON text, compound values as embedded JSON.
fn cell_text(value: Option<&serde_json::Value>) -> String {
    match value {
        None => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::record_from_value;
    use serde_json::json;

    fn record(value: serde_json::Value) -> TrialRecord {
        record_from_value(value)
    }

    fn store_with(records: Vec<(NodeId, serde_json::Value)>) -> DataStore {
        let mut store = DataStore::new();
        for (producer, value) in records {
            store.write(producer, record(value), None, TrialRecord::new());
        }
        store
    }

    #[test]
    fn write_then_get_preserves_order_and_count() {
        let root = NodeId::root();
        let store = store_with(
            (0..5)
                .map(|i| (root.child(i, 0), json!({"trial": i})))
                .collect(),
        );

        let data = store.get();
        assert_eq!(data.count(), 5);
        for (i, rec) in data.iter().enumerate() {
            assert_eq!(rec["trial"], json!(i));
        }
    }

    #[test]
    fn write_merge_precedence() {
        let mut store = DataStore::new();
        let mut props = TrialRecord::new();
        props.insert("participant".into(), json!("p01"));
        props.insert("phase".into(), json!("from_properties"));
        store.add_properties(&props);

        let node_data = record(json!({"phase": "practice", "block": 1}));
        let mut bookkeeping = TrialRecord::new();
        bookkeeping.insert("trial_index".into(), json!(0));
        bookkeeping.insert("block".into(), json!("bookkeeping"));

        store.write(
            NodeId::root().child(0, 0),
            record(json!({"rt": 412, "phase": "from_plugin"})),
            Some(&node_data),
            bookkeeping,
        );

        let rec = store.get().last().unwrap().clone();
        // Node data beats plugin data; properties beat node data;
        // bookkeeping beats everything.
        assert_eq!(rec["rt"], json!(412));
        assert_eq!(rec["phase"], json!("from_properties"));
        assert_eq!(rec["block"], json!("bookkeeping"));
        assert_eq!(rec["participant"], json!("p01"));
        assert_eq!(rec["trial_index"], json!(0));
    }

    #[test]
    fn snapshots_are_isolated_from_the_store() {
        let mut store = store_with(vec![(NodeId::root().child(0, 0), json!({"a": 1}))]);
        let snapshot = store.get();

        let mut extra = TrialRecord::new();
        extra.insert("late".into(), json!(true));
        store.add_to_last(&extra);

        assert!(snapshot.last().unwrap().get("late").is_none());
        assert_eq!(store.get().last().unwrap()["late"], json!(true));
    }

    #[test]
    fn add_properties_applies_retroactively_and_prospectively() {
        let mut store = store_with(vec![(NodeId::root().child(0, 0), json!({"a": 1}))]);

        let mut props = TrialRecord::new();
        props.insert("participant".into(), json!("p02"));
        store.add_properties(&props);

        store.write(
            NodeId::root().child(1, 0),
            record(json!({"a": 2})),
            None,
            TrialRecord::new(),
        );

        let data = store.get();
        assert_eq!(data.records()[0]["participant"], json!("p02"));
        assert_eq!(data.records()[1]["participant"], json!("p02"));
    }

    #[test]
    fn add_to_last_only_touches_final_record() {
        let mut store = store_with(vec![
            (NodeId::root().child(0, 0), json!({"i": 0})),
            (NodeId::root().child(1, 0), json!({"i": 1})),
        ]);
        let mut props = TrialRecord::new();
        props.insert("tag".into(), json!("x"));
        store.add_to_last(&props);

        let data = store.get();
        assert!(data.records()[0].get("tag").is_none());
        assert_eq!(data.records()[1]["tag"], json!("x"));
    }

    #[test]
    fn get_data_by_node_filters_subtree() {
        let timeline_a = NodeId::root().child(0, 0);
        let timeline_b = NodeId::root().child(1, 0);
        let store = store_with(vec![
            (timeline_a.child(0, 0), json!({"from": "a0"})),
            (timeline_a.child(1, 0), json!({"from": "a1"})),
            (timeline_b.child(0, 0), json!({"from": "b0"})),
        ]);

        let a_data = store.get_data_by_node(&timeline_a);
        assert_eq!(a_data.count(), 2);
        assert!(a_data.iter().all(|r| r["from"].as_str().unwrap().starts_with('a')));
    }

    #[test]
    fn last_timeline_data_ignores_earlier_sibling_timeline() {
        let timeline_a = NodeId::root().child(0, 0);
        let timeline_b = NodeId::root().child(1, 0);
        let store = store_with(vec![
            (timeline_a.child(0, 0), json!({"from": "a0"})),
            (timeline_a.child(1, 0), json!({"from": "a1"})),
            (timeline_b.child(0, 0), json!({"from": "b0"})),
        ]);

        let last = store.get_last_timeline_data();
        assert_eq!(last.count(), 1);
        assert_eq!(last.first().unwrap()["from"], json!("b0"));
    }

    #[test]
    fn last_timeline_data_spans_all_passes() {
        // The same timeline instance producing records on two loop
        // iterations: all of them belong to the enclosing timeline.
        let timeline = NodeId::root().child(0, 0);
        let store = store_with(vec![
            (timeline.child(0, 0), json!({"pass": 0})),
            (timeline.child(0, 1), json!({"pass": 1})),
        ]);

        assert_eq!(store.get_last_timeline_data().count(), 2);
    }

    #[test]
    fn last_timeline_data_empty_store() {
        assert_eq!(DataStore::new().get_last_timeline_data().count(), 0);
    }

    #[test]
    fn interaction_records_are_separate_from_data() {
        let mut store = DataStore::new();
        store.record_interaction(InteractionEvent::Blur, 2, 1500);
        store.record_interaction(InteractionEvent::Focus, 2, 2250);

        assert_eq!(store.get().count(), 0);
        let interactions = store.get_interaction_data();
        assert_eq!(interactions.len(), 2);
        assert_eq!(interactions[0].event, InteractionEvent::Blur);
        assert_eq!(interactions[1].time, 2250);
    }

    #[test]
    fn recorded_interactions_reach_event_subscribers() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let mut store = DataStore::new();
        store.attach_emitter(emitter);

        store.record_interaction(InteractionEvent::Blur, 3, 1200);

        match rx.try_recv().unwrap() {
            RunEvent::InteractionRecorded { event, trial, time } => {
                assert_eq!(event, InteractionEvent::Blur);
                assert_eq!(trial, 3);
                assert_eq!(time, 1200);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(store.get_interaction_data().len(), 1);
    }

    #[test]
    fn records_since_watermark() {
        let mut store = store_with(vec![(NodeId::root().child(0, 0), json!({"i": 0}))]);
        let watermark = store.len();
        store.write(
            NodeId::root().child(0, 1),
            record(json!({"i": 1})),
            None,
            TrialRecord::new(),
        );

        let since = store.records_since(watermark);
        assert_eq!(since.count(), 1);
        assert_eq!(since.first().unwrap()["i"], json!(1));
    }

    // --- DataCollection ---

    #[test]
    fn filter_and_select() {
        let data = DataCollection::new(vec![
            record(json!({"block": "a", "rt": 300})),
            record(json!({"block": "b", "rt": 400})),
            record(json!({"block": "a", "rt": 500})),
        ]);

        assert_eq!(data.filter("block", &json!("a")).count(), 2);
        assert_eq!(
            data.select("rt"),
            vec![json!(300), json!(400), json!(500)]
        );
        assert_eq!(data.filter_custom(|r| r["rt"] == json!(400)).count(), 1);
    }

    #[test]
    fn select_missing_key_aligns_with_null() {
        let data = DataCollection::new(vec![
            record(json!({"rt": 300})),
            record(json!({"other": 1})),
        ]);
        assert_eq!(data.select("rt"), vec![json!(300), serde_json::Value::Null]);
    }

    #[test]
    fn first_n_and_last_n_clamp() {
        let data = DataCollection::new(vec![
            record(json!({"i": 0})),
            record(json!({"i": 1})),
            record(json!({"i": 2})),
        ]);
        assert_eq!(data.first_n(2).count(), 2);
        assert_eq!(data.last_n(2).first().unwrap()["i"], json!(1));
        assert_eq!(data.first_n(10).count(), 3);
        assert_eq!(data.last_n(0).count(), 0);
    }

    #[test]
    fn csv_columns_are_union_in_first_seen_order() {
        let data = DataCollection::new(vec![
            record(json!({"a": 1, "b": 2})),
            record(json!({"b": 3, "c": 4})),
        ]);
        let csv = data.csv();
        let mut lines = csv.split("\r\n");
        assert_eq!(lines.next().unwrap(), "\"a\",\"b\",\"c\"");
        assert_eq!(lines.next().unwrap(), "\"1\",\"2\",\"\"");
        assert_eq!(lines.next().unwrap(), "\"\",\"3\",\"4\"");
        assert_eq!(lines.next().unwrap(), "");
    }

    #[test]
    fn csv_quotes_every_field_and_doubles_embedded_quotes() {
        let data = DataCollection::new(vec![record(json!({"quip": "say \"hi\""}))]);
        let csv = data.csv();
        assert_eq!(csv, "\"quip\"\r\n\"say \"\"hi\"\"\"\r\n");
    }

    #[test]
    fn csv_serializes_nested_values_as_json_text() {
        let data = DataCollection::new(vec![record(
            json!({"resp": ["a", "b"], "meta": {"ok": true}, "flag": null}),
        )]);
        let csv = data.csv();
        let mut lines = csv.split("\r\n");
        // Keys iterate alphabetically within a record.
        assert_eq!(lines.next().unwrap(), "\"flag\",\"meta\",\"resp\"");
        assert_eq!(
            lines.next().unwrap(),
            "\"null\",\"{\"\"ok\"\":true}\",\"[\"\"a\"\",\"\"b\"\"]\""
        );
    }

    #[test]
    fn csv_uses_crlf_line_endings() {
        let data = DataCollection::new(vec![record(json!({"a": 1}))]);
        let csv = data.csv();
        assert!(csv.ends_with("\r\n"));
        assert_eq!(csv.matches("\r\n").count(), 2);
    }

    #[test]
    fn json_pretty_indents_with_tabs() {
        let data = DataCollection::new(vec![record(json!({"a": 1}))]);
        let pretty = data.json(true).unwrap();
        assert!(pretty.contains("\n\t{"));
        let compact = data.json(false).unwrap();
        assert_eq!(compact, "[{\"a\":1}]");
    }

    #[test]
    fn csv_round_trips_key_value_pairs() {
        let data = DataCollection::new(vec![
            record(json!({"rt": 500, "response": "a", "correct": true})),
            record(json!({"rt": 230, "response": "b", "correct": false})),
        ]);
        let csv = data.csv();
        let mut lines: Vec<&str> = csv.split("\r\n").filter(|l| !l.is_empty()).collect();
        let header = parse_csv_line(lines.remove(0));

        for (row_text, original) in lines.iter().zip(data.iter()) {
            let fields = parse_csv_line(row_text);
            for (col, field) in header.iter().zip(&fields) {
                let expected = cell_text(original.get(col.as_str()));
                assert_eq!(field, &expected);
            }
        }
    }

    /// Minimal parser for the exporter's own quoting scheme.
    fn parse_csv_line(line: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        let mut in_quotes = false;
        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        current.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                '"' => in_quotes = true,
                ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
                c => current.push(c),
            }
        }
        fields.push(current);
        fields
    }
}
