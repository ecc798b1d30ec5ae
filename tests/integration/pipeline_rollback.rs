#![allow(missing_docs)]

use derivation::actions::{
    Action, AssignLabel, BranchLoad, BuildUri, ClassRef, Endpoint, Link, LinkStat, RunScript,
};
use derivation::engine::{ActionState, Engine, ResolvedMethod, RollbackLog, RunOptions, Step};
use derivation::model::{MethodDocument, Schema, VALUE_PROPERTY};
use derivation::query::QueryPlan;
use derivation::scripts::{ScriptCall, ScriptParams, ScriptRegistry};
use derivation::store::{GraphStore, GraphWrite, MemoryGraph, Params, WriteReceipt};
use derivation::{Error, Result, Table, Value};

/// Store whose node deletions or edges of one type fail on demand.
struct BrittleStore {
    inner: MemoryGraph,
    refuse_deletes: bool,
    refuse_edges: Option<&'static str>,
}

impl GraphStore for BrittleStore {
    fn fetch(&self, plan: &QueryPlan) -> Result<Table> {
        self.inner.fetch(plan)
    }

    fn run_cypher(&mut self, text: &str, params: &Params) -> Result<Table> {
        self.inner.run_cypher(text, params)
    }

    fn apply(&mut self, write: &GraphWrite) -> Result<WriteReceipt> {
        if self.refuse_deletes && matches!(write, GraphWrite::DeleteNodes { .. }) {
            return Err(Error::Store("connection reset".into()));
        }
        if let GraphWrite::MergeEdges { edge_type, .. } = write {
            if self.refuse_edges == Some(edge_type.as_str()) {
                return Err(Error::Store(format!("cannot merge {edge_type} edges")));
            }
        }
        self.inner.apply(write)
    }

    fn load_method(&self, root_id: &str) -> Result<MethodDocument> {
        self.inner.load_method(root_id)
    }

    fn load_schema(&self) -> Result<Schema> {
        self.inner.load_schema()
    }

    fn import_method(&mut self, doc: &MethodDocument) -> Result<()> {
        self.inner.import_method(doc)
    }
}

fn seeded() -> (MemoryGraph, ScriptRegistry) {
    let mut store = MemoryGraph::new();
    let s1 = store.add_node(
        &["Subject"],
        [(VALUE_PROPERTY, Value::from("S1")), ("uri", Value::from("old"))],
    );
    let s2 = store.add_node(&["Subject"], [(VALUE_PROPERTY, Value::from("S2"))]);
    let table = Table::from_rows(
        ["SUBJ", "_id_SUBJ", "ARM"],
        vec![
            vec![Value::from("S1"), Value::NodeRef(s1), Value::from("A")],
            vec![Value::from("S2"), Value::NodeRef(s2), Value::from("B")],
        ],
    )
    .unwrap();
    let mut scripts = ScriptRegistry::with_builtins();
    scripts.register("study", "seed", move |_, _| Ok(table.clone()));
    (store, scripts)
}

fn seed() -> Step {
    Step::new(
        "seed",
        Action::RunScript(RunScript {
            call: ScriptCall::new("study", "seed", ScriptParams::new()),
        }),
    )
}

fn link_arm() -> Step {
    Step::new(
        "link_arm",
        Action::Link(Link {
            from: Endpoint::ids(ClassRef::new("Subject", "SUBJ")),
            to: Endpoint::values(ClassRef::new("Arm", "ARM"), true, false),
            edge_type: "Arm".into(),
        }),
    )
}

fn enrol() -> Step {
    Step::new(
        "enrol",
        Action::AssignLabel(AssignLabel {
            on: ClassRef::new("Subject", "SUBJ"),
            target: ClassRef::new("Enrolled", "ENR"),
        }),
    )
}

fn uri() -> Step {
    Step::new(
        "uri",
        Action::BuildUri(BuildUri {
            prefix: "trial".into(),
            targets: vec![ClassRef::new("Subject", "SUBJ")],
            by: vec!["SUBJ".into()],
            labels: Vec::new(),
            store_on_existing_nodes: true,
        }),
    )
}

fn missing_branch() -> Step {
    Step::new(
        "load_missing",
        Action::BranchLoad(BranchLoad {
            key: "never_saved".into(),
        }),
    )
}

fn method(steps: Vec<Step>) -> ResolvedMethod {
    ResolvedMethod {
        root: "derive_arm".into(),
        steps,
    }
}

fn states(records: &[derivation::engine::ActionRecord]) -> Vec<ActionState> {
    records.iter().map(|record| record.state).collect()
}

#[test]
fn every_write_is_undone_when_a_later_action_fails() {
    let (store, scripts) = seeded();
    let mut engine = Engine::new(store).with_scripts(scripts);
    let steps = vec![seed(), enrol(), uri(), link_arm(), missing_branch()];
    let err = engine
        .execute(&method(steps), &Schema::new(), &RunOptions::default())
        .unwrap_err();

    let failure = err.run_failure().expect("failure details");
    assert!(matches!(err, Error::ActionFailed(_)));
    assert!(matches!(failure.cause, Error::BranchMissing { ref key } if key == "never_saved"));
    assert_eq!(failure.index, 4);
    assert!(failure.rollback_errors.is_empty());
    assert_eq!(
        states(&failure.records),
        [
            ActionState::Applied,
            ActionState::RolledBack,
            ActionState::RolledBack,
            ActionState::RolledBack,
            ActionState::Failed,
        ]
    );

    let graph = engine.store();
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.edge_count(), 0);
    assert!(graph.nodes_with_label("Enrolled").is_empty());
    let s1 = graph
        .find_node("Subject", VALUE_PROPERTY, &Value::from("S1"))
        .expect("S1 survives");
    let s2 = graph
        .find_node("Subject", VALUE_PROPERTY, &Value::from("S2"))
        .expect("S2 survives");
    assert_eq!(graph.node(s1).unwrap().prop("uri"), Value::from("old"));
    assert_eq!(graph.node(s2).unwrap().prop("uri"), Value::Null);
}

#[test]
fn failure_in_the_first_action_has_nothing_to_undo() {
    let (store, scripts) = seeded();
    let mut engine = Engine::new(store).with_scripts(scripts);
    let err = engine
        .execute(&method(vec![missing_branch(), seed(), link_arm()]), &Schema::new(), &RunOptions::default())
        .unwrap_err();
    let failure = err.run_failure().unwrap();
    assert_eq!(failure.action_id, "load_missing");
    assert_eq!(
        states(&failure.records),
        [ActionState::Failed, ActionState::Pending, ActionState::Pending]
    );
    assert!(err.to_string().contains("load_missing"));
    assert_eq!(engine.store().edge_count(), 0);
}

#[test]
fn failed_compensation_is_reported_as_partial_rollback() {
    let (inner, scripts) = seeded();
    let store = BrittleStore {
        inner,
        refuse_deletes: true,
        refuse_edges: None,
    };
    let mut engine = Engine::new(store).with_scripts(scripts);
    let steps = vec![seed(), enrol(), link_arm(), missing_branch()];
    let err = engine
        .execute(&method(steps), &Schema::new(), &RunOptions::default())
        .unwrap_err();

    assert!(matches!(err, Error::PartialRollback(_)));
    let failure = err.run_failure().unwrap();
    assert_eq!(failure.rollback_errors.len(), 1);
    assert_eq!(failure.rollback_errors[0].action_id, "link_arm");
    assert!(failure.rollback_errors[0].error.contains("connection reset"));
    assert_eq!(
        states(&failure.records),
        [
            ActionState::Applied,
            ActionState::RolledBack,
            ActionState::RollbackFailed,
            ActionState::Failed,
        ]
    );
    // the earlier compensation still ran after the later one failed
    assert!(engine.store().inner.nodes_with_label("Enrolled").is_empty());
    assert!(err.to_string().contains("compensation(s) failed"));
}

#[test]
fn dry_run_records_skipped_writes_and_keeps_the_graph() -> Result<()> {
    let (store, scripts) = seeded();
    let mut engine = Engine::new(store).with_scripts(scripts);
    let outcome = engine.execute(
        &method(vec![seed(), enrol(), link_arm()]),
        &Schema::new(),
        &RunOptions::dry_run(),
    )?;
    assert_eq!(
        states(&outcome.records),
        [ActionState::Applied, ActionState::Skipped, ActionState::Skipped]
    );
    assert!(outcome.records[1].mutating);
    assert_eq!(outcome.records[2].rows, Some(2));
    assert!(outcome.rollback_log.is_empty());
    assert_eq!(outcome.table.columns(), ["SUBJ", "_id_SUBJ", "ARM"]);
    assert_eq!(engine.store().node_count(), 2);
    Ok(())
}

#[test]
fn rollback_log_written_to_disk_undoes_the_run() -> Result<()> {
    let (store, scripts) = seeded();
    let mut engine = Engine::new(store).with_scripts(scripts);
    let outcome = engine.execute(
        &method(vec![seed(), enrol(), link_arm()]),
        &Schema::new(),
        &RunOptions::default(),
    )?;
    assert_eq!(engine.store().nodes_with_label("Arm").len(), 2);
    assert_eq!(engine.store().edges_of_type("Arm").len(), 2);
    assert_eq!(outcome.rollback_log.entries.len(), 2);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("derive_arm.rollback.json");
    std::fs::write(&path, outcome.rollback_log.to_json_string()?)?;
    let log = RollbackLog::from_json_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(log, outcome.rollback_log);

    assert!(engine.rollback(&log).is_empty());
    assert!(engine.store().nodes_with_label("Arm").is_empty());
    assert!(engine.store().nodes_with_label("Enrolled").is_empty());
    assert_eq!(engine.store().edge_count(), 0);
    assert_eq!(engine.store().node_count(), 2);
    Ok(())
}

#[test]
fn rollback_replay_keeps_going_past_failures() {
    let (inner, scripts) = seeded();
    let store = BrittleStore {
        inner,
        refuse_deletes: false,
        refuse_edges: None,
    };
    let mut engine = Engine::new(store).with_scripts(scripts);
    let outcome = engine
        .execute(
            &method(vec![seed(), enrol(), link_arm()]),
            &Schema::new(),
            &RunOptions::default(),
        )
        .unwrap();
    engine.store_mut().refuse_deletes = true;
    let failures = engine.rollback(&outcome.rollback_log);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action_id, "link_arm");
    assert!(engine.store().inner.nodes_with_label("Enrolled").is_empty());
}

#[test]
fn failed_statistic_discards_statistics_linked_before_it() {
    let mut inner = MemoryGraph::new();
    let a = inner.add_node(&["Arm"], [(VALUE_PROPERTY, Value::from("A"))]);
    let b = inner.add_node(&["Arm"], [(VALUE_PROPERTY, Value::from("B"))]);
    let table = Table::from_rows(
        ["ARM", "_id_ARM", "N", "_uri_N", "PCT", "_uri_PCT"],
        vec![
            vec![
                Value::from("A"),
                Value::NodeRef(a),
                Value::Int(3),
                Value::from("n_N_by_ARM:A"),
                Value::Float(75.0),
                Value::from("pct_PCT_by_ARM:A"),
            ],
            vec![
                Value::from("B"),
                Value::NodeRef(b),
                Value::Int(1),
                Value::from("n_N_by_ARM:B"),
                Value::Float(25.0),
                Value::from("pct_PCT_by_ARM:B"),
            ],
        ],
    )
    .unwrap();
    let mut scripts = ScriptRegistry::with_builtins();
    scripts.register("study", "seed", move |_, _| Ok(table.clone()));
    let store = BrittleStore {
        inner,
        refuse_deletes: false,
        refuse_edges: Some("Percentage"),
    };
    let mut engine = Engine::new(store).with_scripts(scripts);
    let link_stat = Step::new(
        "link_stat",
        Action::LinkStat(LinkStat {
            statistics: vec![
                ClassRef::new("Count", "N"),
                ClassRef::new("Percentage", "PCT"),
            ],
            dimensions: vec![ClassRef::new("Arm", "ARM")],
        }),
    );
    let err = engine
        .execute(&method(vec![seed(), link_stat]), &Schema::new(), &RunOptions::default())
        .unwrap_err();

    assert!(matches!(err, Error::ActionFailed(_)));
    let failure = err.run_failure().unwrap();
    assert_eq!(failure.action_id, "link_stat");
    assert!(matches!(failure.cause, Error::Store(ref msg) if msg.contains("Percentage")));
    assert_eq!(
        states(&failure.records),
        [ActionState::Applied, ActionState::Failed]
    );
    let graph = &engine.store().inner;
    assert!(graph.nodes_with_label("Count").is_empty());
    assert!(graph.nodes_with_label("Percentage").is_empty());
    assert_eq!(graph.edge_count(), 0);
    assert_eq!(graph.node_count(), 2);
}
