#![allow(missing_docs)]

use derivation::model::{ClassNode, RelationshipNode, Schema, VALUE_PROPERTY};
use derivation::query::{
    ColumnNaming, Condition, DataRequest, EdgeDirection, ExistenceCheck, QueryBuildError,
    QueryBuilder, RelDescriptor,
};
use derivation::store::{GraphStore, MemoryGraph};
use derivation::{Result, Value};

fn schema() -> Schema {
    Schema::new()
        .with_class(ClassNode::new("Subject").with_short_label("SUBJ"))
        .with_class(ClassNode::new("Treatment").with_short_label("TRT"))
        .with_class(ClassNode::new("Unit").with_short_label("UNIT"))
        .with_relationship(RelationshipNode::new("Subject", "Treatment").with_type("TREATED_WITH"))
}

fn trial() -> MemoryGraph {
    let mut graph = MemoryGraph::new();
    let s1 = graph.add_node(&["Subject"], [(VALUE_PROPERTY, Value::from("S1"))]);
    let s2 = graph.add_node(&["Subject"], [(VALUE_PROPERTY, Value::from("S2"))]);
    let placebo = graph.add_node(&["Treatment"], [(VALUE_PROPERTY, Value::from("Placebo"))]);
    graph.add_edge(s1, "TREATED_WITH", placebo);
    graph.add_edge(s2, "TREATED_WITH", placebo);
    for unit in ["mg", "kg", "mL"] {
        graph.add_node(&["Unit"], [(VALUE_PROPERTY, Value::from(unit))]);
    }
    let ae = graph.add_node(&["Adverse Event"], [(VALUE_PROPERTY, Value::from("Headache"))]);
    graph.add_edge(s1, "Adverse Event", ae);
    graph
}

#[test]
fn inferred_relationship_follows_the_schema() -> Result<()> {
    let schema = schema();
    let request = DataRequest::new().class("Subject").class("Treatment").infer_rels();
    let plan = QueryBuilder::new(&schema).build(&request)?;
    assert!(plan.text.starts_with(
        "MATCH (`SUBJ`:`Subject`), (`TRT`:`Treatment`), (`SUBJ`)-[:`TREATED_WITH`]->(`TRT`)\n"
    ));
    assert_eq!(plan.column_names(), ["SUBJ", "_id_SUBJ", "TRT", "_id_TRT"]);

    let table = trial().fetch(&plan)?;
    assert_eq!(table.len(), 2);
    assert!(table
        .rows()
        .all(|row| row.get("TRT") == Some(&Value::from("Placebo"))));
    Ok(())
}

#[test]
fn unrelated_classes_are_rejected_unless_allowed() -> Result<()> {
    let schema = schema();
    let request = DataRequest::new().class("Subject").class("Unit");
    let err = QueryBuilder::new(&schema).build(&request).unwrap_err();
    assert_eq!(
        err,
        QueryBuildError::Disconnected {
            classes: vec!["Unit".into()]
        }
    );

    let request = request.allow_unrelated_subgraphs().limit(4);
    let plan = QueryBuilder::new(&schema).build(&request)?;
    assert_eq!(plan.text.matches("MATCH").count(), 2);
    assert!(plan.text.ends_with("LIMIT 4"));

    let table = trial().fetch(&plan)?;
    assert_eq!(table.len(), 4, "limit applies to the cross product");
    Ok(())
}

#[test]
fn non_positive_limits_are_invalid() {
    let schema = schema();
    let err = QueryBuilder::new(&schema)
        .build(&DataRequest::new().class("Subject").limit(0))
        .unwrap_err();
    assert_eq!(err.code(), "QueryBuild.InvalidLimit");
}

#[test]
fn empty_request_builds_an_empty_plan() -> Result<()> {
    let schema = schema();
    let plan = QueryBuilder::new(&schema).build(&DataRequest::new())?;
    assert!(plan.is_empty());
    assert!(trial().fetch(&plan)?.is_empty());
    Ok(())
}

#[test]
fn label_naming_uses_full_class_labels() -> Result<()> {
    let schema = schema();
    let mut request = DataRequest::new()
        .relationship(RelDescriptor::new("Subject", "Treatment").with_type("TREATED_WITH"));
    request.options.naming = ColumnNaming::Label;
    let plan = QueryBuilder::new(&schema).build(&request)?;
    assert_eq!(
        plan.column_names(),
        ["Subject", "_id_Subject", "Treatment", "_id_Treatment"]
    );
    Ok(())
}

#[test]
fn existence_checks_filter_on_neighbours() -> Result<()> {
    let schema = schema();
    let request = DataRequest::new().class("Subject").existence(
        "Subject",
        ExistenceCheck {
            negated: true,
            direction: EdgeDirection::Out,
            include: vec!["Adverse Event".into()],
            exclude: Vec::new(),
        },
    );
    let plan = QueryBuilder::new(&schema).build(&request)?;
    assert!(plan
        .text
        .contains("WHERE NOT EXISTS {MATCH (`SUBJ`)-[]->(x) WHERE (x:`Adverse Event`)}"));

    let table = trial().fetch(&plan)?;
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(0, "SUBJ"), Some(&Value::from("S2")));
    Ok(())
}

#[test]
fn list_membership_binds_one_parameter() -> Result<()> {
    let schema = schema();
    let request = DataRequest::new().class("Subject").condition(
        "Subject",
        VALUE_PROPERTY,
        Condition::OneOf(vec!["S1".into(), "S3".into()]),
    );
    let plan = QueryBuilder::new(&schema).build(&request)?;
    assert_eq!(plan.params.len(), 1);
    assert!(plan.text.contains("`SUBJ`.`rdfs:label` IN $par_1"));
    assert_eq!(plan.params_json()["par_1"], serde_json::json!(["S1", "S3"]));

    let table = trial().fetch(&plan)?;
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(0, "SUBJ"), Some(&Value::from("S1")));
    Ok(())
}

#[test]
fn plan_hash_tracks_text_and_parameters() -> Result<()> {
    let schema = schema();
    let build = |value: &str| {
        QueryBuilder::new(&schema).build(&DataRequest::new().class("Subject").condition(
            "Subject",
            VALUE_PROPERTY,
            Condition::Equals(value.into()),
        ))
    };
    let first = build("S1")?;
    assert_eq!(first.hash, build("S1")?.hash);
    let other = build("S2")?;
    assert_eq!(first.text, other.text);
    assert_ne!(first.hash, other.hash);
    Ok(())
}

#[test]
fn requests_read_from_json_match_the_builder_api() -> Result<()> {
    let schema = schema();
    let request: DataRequest = serde_json::from_value(serde_json::json!({
        "classes": ["Subject"],
        "relationships": [{"from": "Subject", "to": "Treatment", "type": "TREATED_WITH"}],
        "where_map": {"Treatment": {"rdfs:label": "Placebo"}},
        "options": {"limit": 10}
    }))?;
    let built = DataRequest::new()
        .class("Subject")
        .relationship(RelDescriptor::new("Subject", "Treatment").with_type("TREATED_WITH"))
        .condition("Treatment", VALUE_PROPERTY, Condition::Equals("Placebo".into()))
        .limit(10);
    let builder = QueryBuilder::new(&schema);
    assert_eq!(builder.build(&request)?, builder.build(&built)?);
    Ok(())
}
