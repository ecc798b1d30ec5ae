#![allow(missing_docs)]

use serde_json::{json, Value as JsonValue};

use derivation::actions::Action;
use derivation::engine::{ActionState, Engine, RunOptions, PERCENT_CLASS};
use derivation::model::{MethodDocument, MethodType, Schema, VALUE_PROPERTY};
use derivation::store::MemoryGraph;
use derivation::{Result, Value};

fn node(id: &str, labels: &[&str], properties: JsonValue) -> JsonValue {
    json!({"id": id, "labels": labels, "properties": properties})
}

fn edge(from: &str, edge_type: &str, to: &str) -> JsonValue {
    json!({"fromId": from, "toId": to, "type": edge_type})
}

fn class(id: &str, label: &str, short: &str) -> JsonValue {
    node(id, &["Class"], json!({"label": label, "short_label": short}))
}

fn document(root: &str, nodes: Vec<JsonValue>, relationships: Vec<JsonValue>) -> Result<MethodDocument> {
    let text = json!({"nodes": nodes, "relationships": relationships}).to_string();
    MethodDocument::from_json_str(root, &text)
}

/// Subjects with a treatment arm and a sex, counted per arm and per
/// arm and sex.
fn counts_by_arm() -> Result<MethodDocument> {
    let mut dim_arm = edge("stat", "DIMENSION", "c_arm");
    dim_arm["properties"] = json!({"required": true, "denominator": true});
    document(
        "derive_counts",
        vec![
            node("derive_counts", &["Method"], json!({})),
            node("fetch", &["Method"], json!({"type": "get_data"})),
            node("stat", &["Method"], json!({"type": "apply_stat"})),
            class("c_subj", "Subject", "USUBJID"),
            class("c_arm", "Treatment Arm", "ARM"),
            class("c_sex", "Sex", "SEX"),
            class("c_n", "Number of subjects", "n"),
            node("r_arm", &["Relationship"], json!({"relationship_type": "Treatment Arm"})),
            node("r_sex", &["Relationship"], json!({"relationship_type": "Sex"})),
        ],
        vec![
            edge("derive_counts", "METHOD_ACTION", "fetch"),
            edge("derive_counts", "METHOD_ACTION", "stat"),
            edge("fetch", "NEXT", "stat"),
            edge("fetch", "SOURCE_RELATIONSHIP", "r_arm"),
            edge("fetch", "SOURCE_RELATIONSHIP", "r_sex"),
            edge("r_arm", "FROM", "c_subj"),
            edge("r_arm", "TO", "c_arm"),
            edge("r_sex", "FROM", "c_subj"),
            edge("r_sex", "TO", "c_sex"),
            edge("stat", "RESULT", "c_subj"),
            edge("stat", "STATISTIC", "c_n"),
            dim_arm,
            edge("stat", "DIMENSION", "c_sex"),
        ],
    )
}

fn trial() -> MemoryGraph {
    let mut graph = MemoryGraph::new();
    let arm_a = graph.add_node(&["Treatment Arm"], [(VALUE_PROPERTY, Value::from("A"))]);
    let arm_b = graph.add_node(&["Treatment Arm"], [(VALUE_PROPERTY, Value::from("B"))]);
    let male = graph.add_node(&["Sex"], [(VALUE_PROPERTY, Value::from("M"))]);
    let female = graph.add_node(&["Sex"], [(VALUE_PROPERTY, Value::from("F"))]);
    for (subject, arm, sex) in [
        ("S1", arm_a, male),
        ("S2", arm_a, female),
        ("S3", arm_b, female),
        ("S4", arm_a, female),
    ] {
        let subject = graph.add_node(&["Subject"], [(VALUE_PROPERTY, Value::from(subject))]);
        graph.add_edge(subject, "Treatment Arm", arm);
        graph.add_edge(subject, "Sex", sex);
    }
    graph
}

fn step_ids(engine: &Engine<MemoryGraph>, doc: &MethodDocument) -> Result<Vec<String>> {
    let resolved = engine.resolve(doc, &Schema::from_document(doc))?;
    Ok(resolved.steps.into_iter().map(|s| s.id).collect())
}

#[test]
fn apply_stat_expands_into_deterministic_steps() -> Result<()> {
    let doc = counts_by_arm()?;
    let engine = Engine::new(MemoryGraph::new());
    let resolved = engine.resolve(&doc, &Schema::from_document(&doc))?;
    let ids: Vec<&str> = resolved.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        &ids[..5],
        ["fetch", "stat_branch1", "stat_run_script_0", "stat_build_uri_0", "stat_link_stat_0"]
    );
    assert!(ids.contains(&"stat_numerator_1"));
    assert!(ids.contains(&"stat_branch_combine_1"));
    assert_eq!(ids.last(), Some(&"stat_link_pct_denominator_1"));
    assert_eq!(step_ids(&engine, &doc)?, step_ids(&engine, &doc)?);

    let kinds: Vec<MethodType> = resolved.steps.iter().map(|s| s.action.kind()).collect();
    assert_eq!(kinds[2], MethodType::CallApi);
    assert!(!kinds.contains(&MethodType::ApplyStat));
    let divide = resolved
        .steps
        .iter()
        .find(|s| s.id == "stat_run_script_divide_1")
        .expect("divide step");
    assert!(matches!(divide.action, Action::RunScript(_)));
    Ok(())
}

#[test]
fn apply_stat_counts_and_percentages_land_in_the_graph() -> Result<()> {
    let doc = counts_by_arm()?;
    let schema = Schema::from_document(&doc);
    let mut engine = Engine::new(trial());
    let resolved = engine.resolve(&doc, &schema)?;
    let outcome = engine.execute(&resolved, &schema, &RunOptions::default())?;
    assert!(outcome.records.iter().all(|r| r.state == ActionState::Applied));

    // ARM: A, B; ARM x SEX: A/M, A/F, B/F; denominators reuse the ARM counts
    let graph = engine.store();
    assert_eq!(graph.nodes_with_label("Number of subjects").len(), 5);
    let arm_a = graph
        .find_node("Number of subjects", "uri", &Value::from("USUBJID_n_by_ARM:A"))
        .expect("count for arm A");
    assert_eq!(graph.node(arm_a).unwrap().prop(VALUE_PROPERTY), Value::Int(3));

    assert_eq!(graph.nodes_with_label(PERCENT_CLASS).len(), 3);
    let b_female = graph
        .find_node(PERCENT_CLASS, "uri", &Value::from("USUBJID(n)_npct_by_ARM:B/SEX:F"))
        .expect("percentage for B/F");
    assert_eq!(graph.node(b_female).unwrap().prop(VALUE_PROPERTY), Value::Float(100.0));
    assert!(graph.has_edge(arm_a, "Denominator of", {
        graph
            .find_node(PERCENT_CLASS, "uri", &Value::from("USUBJID(n)_npct_by_ARM:A/SEX:F"))
            .expect("percentage for A/F")
    }));
    assert_eq!(graph.edges_of_type("Numerator of").len(), 3);
    assert_eq!(graph.edges_of_type("Denominator of").len(), 3);

    assert_eq!(outcome.table.len(), 3);
    assert!(outcome.table.columns().contains(&"npct".to_owned()));

    assert!(engine.rollback(&outcome.rollback_log).is_empty());
    assert!(engine.store().nodes_with_label("Number of subjects").is_empty());
    assert!(engine.store().nodes_with_label(PERCENT_CLASS).is_empty());
    Ok(())
}

#[test]
fn apply_stat_needs_exactly_one_result() -> Result<()> {
    let mut doc = counts_by_arm()?;
    doc.relationships.push(derivation::model::EdgeRecord::new("stat", "RESULT", "c_arm"));
    let err = Engine::new(MemoryGraph::new())
        .resolve(&doc, &Schema::from_document(&doc))
        .unwrap_err();
    assert_eq!(err.code(), "Resolution.InvalidProperty");
    Ok(())
}

fn decode_sex() -> Result<MethodDocument> {
    document(
        "derive_sex_decoded",
        vec![
            node("derive_sex_decoded", &["Method"], json!({})),
            node("fetch", &["Method"], json!({"type": "get_data"})),
            node("decode", &["Method"], json!({"type": "decode"})),
            class("c_subj", "Subject", "USUBJID"),
            class("c_sex", "Sex", "SEX"),
            class("c_sexd", "Sex (Decoded)", "SEXD"),
            node("t_m", &["Term"], json!({"rdfs:label": "M"})),
            node("t_f", &["Term"], json!({"rdfs:label": "F"})),
            node("t_male", &["Term"], json!({"rdfs:label": "Male"})),
            node("t_female", &["Term"], json!({"rdfs:label": "Female"})),
            node("r_sex", &["Relationship"], json!({"relationship_type": "Sex"})),
            node("r_dec", &["Relationship"], json!({"relationship_type": "Decoded as"})),
        ],
        vec![
            edge("derive_sex_decoded", "METHOD_ACTION", "fetch"),
            edge("derive_sex_decoded", "METHOD_ACTION", "decode"),
            edge("fetch", "NEXT", "decode"),
            edge("fetch", "SOURCE_RELATIONSHIP", "r_sex"),
            edge("decode", "FROM_CLASS", "c_sex"),
            edge("decode", "TO_CLASS", "c_sexd"),
            edge("r_sex", "FROM", "c_subj"),
            edge("r_sex", "TO", "c_sex"),
            edge("r_dec", "FROM", "c_sex"),
            edge("r_dec", "TO", "c_sexd"),
            edge("c_sex", "HAS_CONTROLLED_TERM", "t_m"),
            edge("c_sex", "HAS_CONTROLLED_TERM", "t_f"),
            edge("c_sexd", "HAS_CONTROLLED_TERM", "t_male"),
            edge("c_sexd", "HAS_CONTROLLED_TERM", "t_female"),
            edge("t_m", "SAME_AS", "t_male"),
            edge("t_f", "SAME_AS", "t_female"),
        ],
    )
}

#[test]
fn decode_links_coded_values_to_their_decodes() -> Result<()> {
    let doc = decode_sex()?;
    let schema = Schema::from_document(&doc);
    let mut engine = Engine::new(trial());
    let resolved = engine.resolve(&doc, &schema)?;
    let ids: Vec<&str> = resolved.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["fetch", "decode_run_script", "decode_link"]);

    let outcome = engine.execute(&resolved, &schema, &RunOptions::default())?;
    assert_eq!(outcome.table.len(), 4);
    let graph = engine.store();
    let male = graph
        .find_node("Sex", VALUE_PROPERTY, &Value::from("M"))
        .expect("M");
    let decoded = graph
        .find_node("Sex (Decoded)", VALUE_PROPERTY, &Value::from("Male"))
        .expect("Male");
    assert!(graph.has_edge(male, "Decoded as", decoded));
    assert_eq!(graph.nodes_with_label("Sex (Decoded)").len(), 2);
    assert_eq!(graph.edges_of_type("Decoded as").len(), 2);
    Ok(())
}

#[test]
fn decode_without_equivalent_terms_is_rejected() -> Result<()> {
    let mut doc = decode_sex()?;
    doc.relationships.retain(|e| e.edge_type != "SAME_AS");
    let err = Engine::new(MemoryGraph::new())
        .resolve(&doc, &Schema::from_document(&doc))
        .unwrap_err();
    assert_eq!(err.code(), "Resolution.MissingMetadata");
    Ok(())
}

#[test]
fn subject_level_link_steps_follow_the_fetch() -> Result<()> {
    let doc = document(
        "derive_age",
        vec![
            node("derive_age", &["Method"], json!({})),
            node("fetch", &["Method"], json!({"type": "get_data"})),
            node("age", &["Method"], json!({"type": "subject_level_link"})),
            class("c_subj", "Subject", "USUBJID"),
            node("c_age", &["Class"], json!({"label": "Age", "short_label": "AGE", "data_type": "int"})),
            node("t_age", &["Term"], json!({"rdfs:label": "AGE"})),
            node("r_age", &["Relationship"], json!({"relationship_type": "Age"})),
        ],
        vec![
            edge("derive_age", "METHOD_ACTION", "fetch"),
            edge("derive_age", "METHOD_ACTION", "age"),
            edge("fetch", "NEXT", "age"),
            edge("fetch", "SOURCE_RELATIONSHIP", "r_age"),
            edge("r_age", "FROM", "c_subj"),
            edge("r_age", "TO", "c_age"),
            edge("age", "SUBJECT_LEVEL", "c_age"),
            edge("age", "TERM", "t_age"),
        ],
    )?;
    let engine = Engine::new(MemoryGraph::new());
    assert_eq!(
        step_ids(&engine, &doc)?,
        [
            "fetch",
            "age_assign_class",
            "age_build_uri",
            "age_record_link",
            "age_param_link",
            "age_record_value_link"
        ]
    );
    let resolved = engine.resolve(&doc, &Schema::from_document(&doc))?;
    let Action::BuildUri(uri) = &resolved.steps[2].action else {
        panic!("expected the record uri step");
    };
    assert_eq!(uri.prefix, "Subject_level_AGE");
    assert_eq!(uri.by, ["USUBJID"]);
    assert_eq!(resolved.mutating(), 4);
    Ok(())
}
