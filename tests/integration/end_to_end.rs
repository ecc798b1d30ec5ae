#![allow(missing_docs)]

use serde_json::json;

use derivation::engine::{ActionState, Engine, RunOptions};
use derivation::model::{MethodDocument, VALUE_PROPERTY};
use derivation::scripts::{ScriptParams, ScriptRegistry};
use derivation::store::{GraphStore, MemoryGraph};
use derivation::{Error, ResolutionError, Result, Table, Value};

const ROOT: &str = "derive_adult_age_groups";

fn method_document() -> Result<MethodDocument> {
    let text = json!({
        "nodes": [
            {"id": "m0", "labels": ["Method"], "properties": {"id": ROOT}},
            {"id": "m1", "labels": ["Method"], "properties": {"id": "fetch", "type": "get_data"}},
            {"id": "m2", "labels": ["Method"], "properties": {"id": "adults", "type": "filter"}},
            {"id": "m3", "labels": ["Method"], "properties": {
                "id": "group", "type": "run_script", "package": "study", "script": "age_group"
            }},
            {"id": "m4", "labels": ["Method"], "properties": {"id": "link", "type": "link", "how": "merge"}},
            {"id": "m5", "labels": ["Method"], "properties": {"id": "save", "type": "branch_save"}},
            {"id": "c_subj", "labels": ["Class"], "properties": {"label": "Subject", "short_label": "SUBJ"}},
            {"id": "c_age", "labels": ["Class"], "properties": {"label": "Age", "short_label": "AGE", "data_type": "int"}},
            {"id": "c_grp", "labels": ["Class"], "properties": {
                "label": "Age Group", "short_label": "AGEGRP", "derived": true
            }},
            {"id": "t_adult", "labels": ["Term"], "properties": {"rdfs:label": "Adult"}},
            {"id": "t_elderly", "labels": ["Term"], "properties": {"rdfs:label": "Elderly"}},
            {"id": "r_age", "labels": ["Relationship"], "properties": {"relationship_type": "Age"}},
            {"id": "r_grp", "labels": ["Relationship"], "properties": {"relationship_type": "HAS_AGE_GROUP"}}
        ],
        "relationships": [
            {"fromId": "m0", "toId": "m1", "type": "METHOD_ACTION"},
            {"fromId": "m0", "toId": "m2", "type": "METHOD_ACTION"},
            {"fromId": "m0", "toId": "m3", "type": "METHOD_ACTION"},
            {"fromId": "m0", "toId": "m4", "type": "METHOD_ACTION"},
            {"fromId": "m0", "toId": "m5", "type": "METHOD_ACTION"},
            {"fromId": "m1", "toId": "m2", "type": "NEXT"},
            {"fromId": "m2", "toId": "m3", "type": "NEXT"},
            {"fromId": "m3", "toId": "m4", "type": "NEXT"},
            {"fromId": "m4", "toId": "m5", "type": "NEXT"},
            {"fromId": "m1", "toId": "r_age", "type": "SOURCE_RELATIONSHIP"},
            {"fromId": "m2", "toId": "c_age", "type": "ON", "properties": {"min": 18, "min_include": true}},
            {"fromId": "m4", "toId": "r_grp", "type": "LINK"},
            {"fromId": "r_age", "toId": "c_subj", "type": "FROM"},
            {"fromId": "r_age", "toId": "c_age", "type": "TO"},
            {"fromId": "r_grp", "toId": "c_subj", "type": "FROM"},
            {"fromId": "r_grp", "toId": "c_grp", "type": "TO"},
            {"fromId": "c_grp", "toId": "t_adult", "type": "HAS_CONTROLLED_TERM"},
            {"fromId": "c_grp", "toId": "t_elderly", "type": "HAS_CONTROLLED_TERM"}
        ]
    })
    .to_string();
    MethodDocument::from_json_str(ROOT, &text)
}

fn age_group(mut table: Table, _: &ScriptParams) -> Result<Table> {
    let groups: Vec<Value> = table
        .column("AGE")
        .unwrap_or_default()
        .into_iter()
        .map(|age| match age {
            Value::Int(age) if *age >= 65 => Value::from("Elderly"),
            Value::Int(_) => Value::from("Adult"),
            _ => Value::Null,
        })
        .collect();
    table.set_column("AGEGRP", groups)?;
    Ok(table)
}

fn study() -> Result<Engine<MemoryGraph>> {
    let mut graph = MemoryGraph::new();
    for (subject, age) in [("S1", 34), ("S2", 70), ("S3", 12)] {
        let subject = graph.add_node(&["Subject"], [(VALUE_PROPERTY, Value::from(subject))]);
        let age = graph.add_node(&["Age"], [(VALUE_PROPERTY, Value::Int(age))]);
        graph.add_edge(subject, "Age", age);
    }
    graph.import_method(&method_document()?)?;

    let mut scripts = ScriptRegistry::with_builtins();
    scripts.register("study", "age_group", age_group);
    Ok(Engine::new(graph).with_scripts(scripts))
}

fn subject(engine: &Engine<MemoryGraph>, name: &str) -> derivation::value::NodeId {
    engine
        .store()
        .find_node("Subject", VALUE_PROPERTY, &Value::from(name))
        .expect("subject")
}

#[test]
fn stored_method_derives_and_links_age_groups() -> Result<()> {
    let mut engine = study()?;
    let outcome = engine.run(ROOT, &RunOptions::default())?;

    let ids: Vec<&str> = outcome.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["fetch", "group", "link", "save"]);
    assert!(outcome.records.iter().all(|r| r.state == ActionState::Applied));
    assert_eq!(outcome.records[0].rows, Some(2), "the filter drops S3");

    let table = &outcome.table;
    assert_eq!(
        table.columns(),
        ["SUBJ", "_id_SUBJ", "AGE", "_id_AGE", "AGEGRP", "_id_AGEGRP"]
    );
    let mut groups: Vec<(String, String)> = table
        .rows()
        .map(|row| {
            let cell = |c: &str| row.get(c).map(ToString::to_string).unwrap_or_default();
            (cell("SUBJ"), cell("AGEGRP"))
        })
        .collect();
    groups.sort();
    assert_eq!(
        groups,
        [
            ("S1".to_owned(), "Adult".to_owned()),
            ("S2".to_owned(), "Elderly".to_owned())
        ]
    );

    let graph = engine.store();
    let adult = graph
        .find_node("Age Group", VALUE_PROPERTY, &Value::from("Adult"))
        .expect("Adult node");
    assert!(graph.has_edge(subject(&engine, "S1"), "HAS_AGE_GROUP", adult));
    assert_eq!(graph.edges_of_type("HAS_AGE_GROUP").len(), 2);
    assert_eq!(outcome.rollback_log.root, ROOT);
    assert_eq!(outcome.rollback_log.entries.len(), 1);
    assert_eq!(outcome.rollback_log.entries[0].action_id, "link");

    assert!(engine.rollback(&outcome.rollback_log).is_empty());
    assert!(engine.store().nodes_with_label("Age Group").is_empty());
    assert!(engine.store().edges_of_type("HAS_AGE_GROUP").is_empty());
    Ok(())
}

#[test]
fn repeated_runs_do_not_duplicate_entities() -> Result<()> {
    let mut engine = study()?;
    engine.run(ROOT, &RunOptions::default())?;
    let second = engine.run(ROOT, &RunOptions::default())?;
    assert_eq!(engine.store().nodes_with_label("Age Group").len(), 2);
    assert_eq!(engine.store().edges_of_type("HAS_AGE_GROUP").len(), 2);
    assert!(second.rollback_log.is_empty());
    Ok(())
}

#[test]
fn limit_and_dry_run_options_apply_to_the_whole_run() -> Result<()> {
    let mut engine = study()?;
    let options = RunOptions {
        limit: Some(1),
        ..RunOptions::dry_run()
    };
    let outcome = engine.run(ROOT, &options)?;
    assert_eq!(outcome.table.len(), 1);
    let link = outcome
        .records
        .iter()
        .find(|r| r.id == "link")
        .expect("link record");
    assert_eq!(link.state, ActionState::Skipped);
    assert!(!outcome.table.columns().contains(&"_id_AGEGRP".to_owned()));
    assert!(engine.store().nodes_with_label("Age Group").is_empty());
    Ok(())
}

#[test]
fn terms_outside_the_class_vocabulary_roll_the_run_back() -> Result<()> {
    let mut engine = study()?;
    let mut scripts = ScriptRegistry::with_builtins();
    scripts.register("study", "age_group", |table: Table, params: &ScriptParams| {
        let mut table = age_group(table, params)?;
        let groups = vec![Value::from("Adult"), Value::from("Senior")];
        table.set_column("AGEGRP", groups)?;
        Ok(table)
    });
    engine = engine.with_scripts(scripts);

    let err = engine.run(ROOT, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, Error::ActionFailed(_)));
    let failure = err.run_failure().expect("failure details");
    assert_eq!(failure.action_id, "link");
    assert!(matches!(failure.cause, Error::NonCompliantValue { .. }));
    assert!(engine.store().nodes_with_label("Age Group").is_empty());
    Ok(())
}

#[test]
fn unknown_methods_fail_before_anything_runs() -> Result<()> {
    let mut engine = study()?;
    let edges = engine.store().edge_count();
    let err = engine.run("derive_nothing", &RunOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::Resolution(ResolutionError::MethodNotFound { ref id }) if id == "derive_nothing"
    ));
    assert_eq!(engine.store().edge_count(), edges);
    Ok(())
}
