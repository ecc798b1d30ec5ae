#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use serde_json::json;

use derivation::engine::Engine;
use derivation::model::{labels, MethodDocument, Schema};
use derivation::store::{GraphStore, MemoryGraph};
use derivation::{Error, ResolutionError, Result};

fn age_groups() -> serde_json::Value {
    json!({
        "nodes": [
            {"id": "0", "labels": ["Method"], "properties": {"id": "derive_age_groups"}},
            {"id": "1", "labels": ["Method"], "properties": {"id": "fetch", "type": "get_data"}},
            {"id": "2", "labels": ["Method"], "properties": {"id": "adults", "type": "filter"}},
            {"id": "3", "labels": ["Method"], "properties": {"id": "save", "type": "branch_save", "branch": "adults"}},
            {"id": "c_age", "labels": ["Class"], "properties": {"label": "Age", "short_label": "AGE", "data_type": "int"}},
            {"id": "c_subj", "labels": ["Class"], "properties": {"label": "Subject", "short_label": "SUBJ"}},
            {"id": "r_age", "labels": ["Relationship"], "properties": {"relationship_type": "Age"}}
        ],
        "relationships": [
            {"fromId": "0", "toId": "1", "type": "METHOD_ACTION"},
            {"fromId": "0", "toId": "2", "type": "METHOD_ACTION"},
            {"fromId": "0", "toId": "3", "type": "METHOD_ACTION"},
            {"fromId": "1", "toId": "2", "type": "NEXT"},
            {"fromId": "2", "toId": "3", "type": "NEXT"},
            {"fromId": "1", "toId": "r_age", "type": "SOURCE_RELATIONSHIP"},
            {"fromId": "2", "toId": "c_age", "type": "ON", "properties": {"min": 18, "min_include": true}},
            {"fromId": "r_age", "toId": "c_subj", "type": "FROM"},
            {"fromId": "r_age", "toId": "c_age", "type": "TO"}
        ]
    })
}

fn write_doc(dir: &Path, file: &str, doc: &serde_json::Value) -> Result<std::path::PathBuf> {
    let path = dir.join(file);
    fs::write(&path, serde_json::to_string_pretty(doc)?)?;
    Ok(path)
}

fn step_ids(doc: &MethodDocument) -> Result<Vec<String>> {
    let schema = Schema::from_document(doc);
    let resolved = Engine::new(MemoryGraph::new()).resolve(doc, &schema)?;
    Ok(resolved.steps.into_iter().map(|step| step.id).collect())
}

#[test]
fn file_stem_names_the_document() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_doc(dir.path(), "derive_age_groups.json", &age_groups())?;
    let doc = MethodDocument::from_path(&path)?;
    assert_eq!(doc.name, "derive_age_groups");
    doc.validate()?;
    assert_eq!(doc.methods().count(), 4);
    assert_eq!(step_ids(&doc)?, ["fetch", "save"]);
    Ok(())
}

#[test]
fn explicit_name_wins_over_the_file_stem() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut text = age_groups();
    text["name"] = json!("derive_age_groups");
    let path = write_doc(dir.path(), "export-2024.json", &text)?;
    let doc = MethodDocument::from_path(&path)?;
    assert_eq!(doc.name, "derive_age_groups");
    assert!(doc.root().is_some());
    Ok(())
}

#[test]
fn structural_problems_are_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut text = age_groups();
    text["relationships"]
        .as_array_mut()
        .expect("relationships")
        .push(json!({"fromId": "3", "toId": "missing", "type": "NEXT"}));
    let doc = MethodDocument::from_path(write_doc(dir.path(), "derive_age_groups.json", &text)?)?;
    assert!(matches!(
        doc.validate(),
        Err(ResolutionError::DanglingEdge { ref node, .. }) if node == "missing"
    ));

    let orphan = json!({
        "nodes": [
            {"id": "root", "labels": ["Method"]},
            {"id": "lost", "labels": ["Method"], "properties": {"type": "branch_save"}}
        ]
    });
    let doc = MethodDocument::from_path(write_doc(dir.path(), "root.json", &orphan)?)?;
    assert_eq!(doc.validate().unwrap_err().code(), "Resolution.Unreachable");

    fs::write(dir.path().join("broken.json"), "{\"nodes\": [")?;
    assert!(matches!(
        MethodDocument::from_path(dir.path().join("broken.json")),
        Err(Error::Json(_))
    ));
    assert!(matches!(
        MethodDocument::from_path(dir.path().join("absent.json")),
        Err(Error::Io(_))
    ));
    Ok(())
}

#[test]
fn imported_methods_load_back_with_their_metadata() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_doc(dir.path(), "derive_age_groups.json", &age_groups())?;
    let scoped = MethodDocument::from_path(&path)?.scoped_to_study("CDISC01")?;
    assert_eq!(scoped.name, "CDISC01_derive_age_groups");

    let mut graph = MemoryGraph::new();
    graph.import_method(&scoped)?;
    let loaded = graph.load_method("CDISC01_derive_age_groups")?;
    loaded.validate()?;
    assert_eq!(loaded.methods().count(), 4);
    assert_eq!(
        step_ids(&loaded)?,
        [
            "CDISC01_derive_age_groups_fetch",
            "CDISC01_derive_age_groups_save"
        ]
    );
    assert_eq!(step_ids(&loaded)?, step_ids(&scoped)?);

    let fetch = loaded
        .node("CDISC01_derive_age_groups_fetch")
        .expect("fetch method");
    assert_eq!(fetch.prop_str("parent_id"), Some("CDISC01_derive_age_groups"));

    let schema = graph.load_schema()?;
    assert_eq!(schema.tag_of("Age"), "AGE");
    assert_eq!(schema.shortest_path("Subject", "Age").map(|p| p.len()), Some(1));
    Ok(())
}

#[test]
fn studies_share_metadata_but_not_methods() -> Result<()> {
    let doc = MethodDocument::from_json_str("derive_age_groups", &age_groups().to_string())?;
    let mut graph = MemoryGraph::new();
    graph.import_method(&doc.scoped_to_study("A")?)?;
    graph.import_method(&doc.scoped_to_study("B")?)?;

    assert_eq!(graph.nodes_with_label(labels::CLASS).len(), 2);
    assert_eq!(graph.nodes_with_label(labels::RELATIONSHIP).len(), 1);
    assert_eq!(graph.nodes_with_label(labels::METHOD).len(), 8);
    assert!(graph.load_method("A_derive_age_groups").is_ok());
    assert!(graph.load_method("B_derive_age_groups").is_ok());
    Ok(())
}

#[test]
fn importing_the_same_method_twice_is_rejected() -> Result<()> {
    let doc = MethodDocument::from_json_str("derive_age_groups", &age_groups().to_string())?
        .scoped_to_study("A")?;
    let mut graph = MemoryGraph::new();
    graph.import_method(&doc)?;
    let nodes = graph.node_count();

    let err = graph.import_method(&doc).unwrap_err();
    assert!(matches!(
        err,
        Error::Resolution(ResolutionError::DuplicateId { ref id }) if id == "A_derive_age_groups"
    ));
    assert_eq!(graph.node_count(), nodes);

    assert_eq!(
        graph.load_method("unknown").unwrap_err().to_string(),
        "method 'unknown' not found"
    );
    Ok(())
}
