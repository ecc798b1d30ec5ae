#![allow(missing_docs)]

use serde_json::{json, Value as JsonValue};

use derivation::actions::BranchStore;
use derivation::engine::{ActionState, Engine, RunOptions};
use derivation::model::{MethodDocument, Schema, VALUE_PROPERTY};
use derivation::store::MemoryGraph;
use derivation::table::JoinKind;
use derivation::{Error, Result, Table, Value};

fn trial() -> MemoryGraph {
    let mut graph = MemoryGraph::new();
    let placebo = graph.add_node(&["Treatment"], [(VALUE_PROPERTY, Value::from("Placebo"))]);
    let active = graph.add_node(&["Treatment"], [(VALUE_PROPERTY, Value::from("Drug X"))]);
    for (subject, treatment) in [("S1", Some(placebo)), ("S2", Some(active)), ("S3", None)] {
        let node = graph.add_node(&["Subject"], [(VALUE_PROPERTY, Value::from(subject))]);
        if let Some(treatment) = treatment {
            graph.add_edge(node, "TREATED_WITH", treatment);
        }
    }
    graph
}

fn method(id: &str, kind: Option<&str>, extra: JsonValue) -> JsonValue {
    let mut properties = json!({});
    if let Some(kind) = kind {
        properties["type"] = json!(kind);
    }
    if let JsonValue::Object(extra) = extra {
        for (key, value) in extra {
            properties[key] = value;
        }
    }
    json!({"id": id, "labels": ["Method"], "properties": properties})
}

fn edge(from: &str, edge_type: &str, to: &str) -> JsonValue {
    json!({"fromId": from, "toId": to, "type": edge_type})
}

fn metadata() -> Vec<JsonValue> {
    vec![
        json!({"id": "c_subj", "labels": ["Class"], "properties": {"label": "Subject", "short_label": "SUBJ"}}),
        json!({"id": "c_trt", "labels": ["Class"], "properties": {"label": "Treatment", "short_label": "TRT"}}),
        json!({"id": "r_trt", "labels": ["Relationship"], "properties": {"relationship_type": "TREATED_WITH"}}),
    ]
}

fn document(name: &str, mut nodes: Vec<JsonValue>, mut relationships: Vec<JsonValue>) -> Result<MethodDocument> {
    nodes.extend(metadata());
    relationships.push(edge("r_trt", "FROM", "c_subj"));
    relationships.push(edge("r_trt", "TO", "c_trt"));
    let text = json!({"nodes": nodes, "relationships": relationships}).to_string();
    MethodDocument::from_json_str(name, &text)
}

fn run(doc: &MethodDocument) -> Result<(Table, Vec<derivation::engine::ActionRecord>)> {
    let schema = Schema::from_document(doc);
    let mut engine = Engine::new(trial());
    let resolved = engine.resolve(doc, &schema)?;
    let outcome = engine.execute(&resolved, &schema, &RunOptions::default())?;
    Ok((outcome.table, outcome.records))
}

#[test]
fn snapshots_are_copies_of_the_context() -> Result<()> {
    let mut branches = BranchStore::default();
    let mut table = Table::from_rows(["SUBJ"], vec![vec![Value::from("S1")]])?;
    branches.save("subjects", &table);
    table.set_column("SUBJ", vec![Value::from("S9")])?;

    let mut loaded = branches.load("subjects")?;
    assert_eq!(loaded.get(0, "SUBJ"), Some(&Value::from("S1")));
    loaded.set_column("SUBJ", vec![Value::from("S7")])?;
    assert_eq!(branches.load("subjects")?.get(0, "SUBJ"), Some(&Value::from("S1")));

    branches.save("subjects", &table);
    assert_eq!(branches.len(), 1);
    assert_eq!(branches.load("subjects")?.get(0, "SUBJ"), Some(&Value::from("S9")));
    Ok(())
}

#[test]
fn unknown_keys_fail_to_load_and_combine() {
    let branches = BranchStore::default();
    assert!(matches!(
        branches.load("arms"),
        Err(Error::BranchMissing { ref key }) if key == "arms"
    ));
    assert!(matches!(
        branches.combine(&["arms".into()], Table::empty()),
        Err(Error::BranchMissing { .. })
    ));
}

#[test]
fn combine_outer_joins_snapshots_and_current_context() -> Result<()> {
    let mut branches = BranchStore::default();
    branches.save(
        "ages",
        &Table::from_rows(
            ["SUBJ", "AGE"],
            vec![
                vec![Value::from("S1"), Value::Int(34)],
                vec![Value::from("S2"), Value::Int(51)],
            ],
        )?,
    );
    let current = Table::from_rows(
        ["SUBJ", "SEX"],
        vec![
            vec![Value::from("S2"), Value::from("F")],
            vec![Value::from("S3"), Value::from("M")],
        ],
    )?;
    let combined = branches.combine(&["ages".into()], current.clone())?;
    assert_eq!(combined.columns(), ["SUBJ", "SEX", "AGE"]);
    assert_eq!(combined.len(), 3);

    let expected = current.join(&branches.load("ages")?, JoinKind::Outer)?;
    assert_eq!(combined.to_json_records(), expected.to_json_records());

    // a context without columns only contributes the snapshots
    let alone = branches.combine(&["ages".into()], Table::empty())?;
    assert_eq!(alone.columns(), ["SUBJ", "AGE"]);
    assert_eq!(alone.len(), 2);
    Ok(())
}

#[test]
fn combined_branches_keep_subjects_without_treatment() -> Result<()> {
    let doc = document(
        "derive_arms",
        vec![
            method("derive_arms", None, json!({})),
            method("subjects", None, json!({})),
            method("fetch_subjects", Some("get_data"), json!({})),
            method("save_subjects", Some("branch_save"), json!({"branch": "all_subjects"})),
            method("treated", None, json!({})),
            method("fetch_treated", Some("get_data"), json!({})),
            method("save_treated", Some("branch_save"), json!({})),
            method("combine", Some("branch_combine"), json!({})),
        ],
        vec![
            edge("derive_arms", "METHOD_ACTION", "subjects"),
            edge("derive_arms", "METHOD_ACTION", "treated"),
            edge("derive_arms", "METHOD_ACTION", "combine"),
            edge("subjects", "NEXT", "treated"),
            edge("treated", "NEXT", "combine"),
            edge("subjects", "METHOD_ACTION", "fetch_subjects"),
            edge("subjects", "METHOD_ACTION", "save_subjects"),
            edge("fetch_subjects", "NEXT", "save_subjects"),
            edge("fetch_subjects", "SOURCE_CLASS", "c_subj"),
            edge("treated", "METHOD_ACTION", "fetch_treated"),
            edge("treated", "METHOD_ACTION", "save_treated"),
            edge("fetch_treated", "NEXT", "save_treated"),
            edge("fetch_treated", "SOURCE_RELATIONSHIP", "r_trt"),
            edge("combine", "METHOD_BRANCH", "save_subjects"),
            edge("combine", "METHOD_BRANCH", "save_treated"),
        ],
    )?;
    let (table, records) = run(&doc)?;

    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(
        ids,
        ["fetch_subjects", "save_subjects", "fetch_treated", "save_treated", "combine"]
    );
    assert!(records.iter().all(|r| r.state == ActionState::Applied));
    assert_eq!(table.len(), 3);

    let mut arms: Vec<(String, String)> = table
        .rows()
        .map(|row| {
            let cell = |col: &str| row.get(col).map(ToString::to_string).unwrap_or_default();
            (cell("SUBJ"), cell("TRT"))
        })
        .collect();
    arms.sort();
    assert_eq!(arms[0], ("S1".to_owned(), "Placebo".to_owned()));
    assert_eq!(arms[1], ("S2".to_owned(), "Drug X".to_owned()));
    assert_eq!(arms[2].0, "S3");
    let untreated = table
        .rows()
        .find(|row| row.get("SUBJ") == Some(&Value::from("S3")))
        .expect("S3 kept");
    assert_eq!(untreated.get("TRT"), Some(&Value::Null));
    Ok(())
}

#[test]
fn branch_load_restores_a_saved_context() -> Result<()> {
    let doc = document(
        "derive_subjects",
        vec![
            method("derive_subjects", None, json!({})),
            method("fetch", Some("get_data"), json!({})),
            method("save", Some("branch_save"), json!({})),
            method(
                "only_s1",
                Some("run_script"),
                json!({"script": "filter_equals", "params": {"column": "SUBJ", "value": "S1"}}),
            ),
            method("restore", Some("branch_load"), json!({})),
        ],
        vec![
            edge("derive_subjects", "METHOD_ACTION", "fetch"),
            edge("derive_subjects", "METHOD_ACTION", "save"),
            edge("derive_subjects", "METHOD_ACTION", "only_s1"),
            edge("derive_subjects", "METHOD_ACTION", "restore"),
            edge("fetch", "NEXT", "save"),
            edge("save", "NEXT", "only_s1"),
            edge("only_s1", "NEXT", "restore"),
            edge("fetch", "SOURCE_CLASS", "c_subj"),
            edge("restore", "METHOD_BRANCH", "save"),
        ],
    )?;
    let (table, records) = run(&doc)?;
    let rows: Vec<Option<usize>> = records.iter().map(|r| r.rows).collect();
    assert_eq!(rows, [Some(3), Some(3), Some(1), Some(3)]);
    assert_eq!(table.len(), 3);
    Ok(())
}

#[test]
fn branch_load_without_a_key_is_rejected_when_resolving() -> Result<()> {
    let doc = document(
        "derive_subjects",
        vec![
            method("derive_subjects", None, json!({})),
            method("fetch", Some("get_data"), json!({})),
            method("restore", Some("branch_load"), json!({})),
        ],
        vec![
            edge("derive_subjects", "METHOD_ACTION", "fetch"),
            edge("derive_subjects", "METHOD_ACTION", "restore"),
            edge("fetch", "NEXT", "restore"),
            edge("fetch", "SOURCE_CLASS", "c_subj"),
        ],
    )?;
    let schema = Schema::from_document(&doc);
    let err = Engine::new(trial()).resolve(&doc, &schema).unwrap_err();
    assert_eq!(err.code(), "Resolution.MissingMetadata");
    Ok(())
}
