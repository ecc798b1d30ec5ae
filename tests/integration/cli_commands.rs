#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

const UNREACHABLE: &str = "http://127.0.0.1:1";

fn method_doc() -> Value {
    json!({
        "nodes": [
            {"id": "derive_arms", "labels": ["Method"]},
            {"id": "fetch", "labels": ["Method"], "properties": {"type": "get_data"}},
            {"id": "link", "labels": ["Method"], "properties": {"type": "link", "how": "merge"}},
            {"id": "c_subj", "labels": ["Class"], "properties": {"label": "Subject", "short_label": "SUBJ"}},
            {"id": "c_arm", "labels": ["Class"], "properties": {"label": "Treatment Arm", "short_label": "ARM"}},
            {"id": "r_arm", "labels": ["Relationship"], "properties": {"relationship_type": "Treatment Arm"}}
        ],
        "relationships": [
            {"fromId": "derive_arms", "toId": "fetch", "type": "METHOD_ACTION"},
            {"fromId": "derive_arms", "toId": "link", "type": "METHOD_ACTION"},
            {"fromId": "fetch", "toId": "link", "type": "NEXT"},
            {"fromId": "fetch", "toId": "c_subj", "type": "SOURCE_CLASS"},
            {"fromId": "fetch", "toId": "c_arm", "type": "SOURCE_CLASS"},
            {"fromId": "link", "toId": "r_arm", "type": "LINK"},
            {"fromId": "r_arm", "toId": "c_subj", "type": "FROM"},
            {"fromId": "r_arm", "toId": "c_arm", "type": "TO"}
        ]
    })
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = format!(
            "[store]\nurl = \"{UNREACHABLE}\"\ntimeout_ms = 500\n\n[remote]\nmode = \"local\"\n"
        );
        fs::write(dir.path().join("derive.toml"), config).expect("write config");
        Self { dir }
    }

    fn write(&self, name: &str, value: &Value) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, serde_json::to_string_pretty(value).expect("json")).expect("write file");
        path
    }

    fn config(&self) -> PathBuf {
        self.dir.path().join("derive.toml")
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("valid json")
}

#[test]
fn validate_lists_resolved_actions() {
    let ws = Workspace::new();
    let doc = ws.write("derive_arms.json", &method_doc());
    let output = cargo_bin_cmd!("derive")
        .arg("validate")
        .arg(&doc)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("derive_arms"));
    assert!(stdout.contains("fetch (get_data)"));
    assert!(stdout.contains("link (link)"));
    assert!(stdout.contains("is valid"));
}

#[test]
fn validate_emits_json() {
    let ws = Workspace::new();
    let doc = ws.write("derive_arms.json", &method_doc());
    let output = cargo_bin_cmd!("derive")
        .args(["--format", "json", "validate"])
        .arg(&doc)
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["root"], "derive_arms");
    let steps = json["steps"].as_array().expect("steps");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["id"], "fetch");
    assert_eq!(steps[0]["kind"], "get_data");
    assert_eq!(steps[0]["mutating"], false);
    assert_eq!(steps[1]["mutating"], true);
}

#[test]
fn validate_rejects_broken_chains() {
    let ws = Workspace::new();
    let mut doc = method_doc();
    doc["relationships"]
        .as_array_mut()
        .expect("relationships")
        .push(json!({"fromId": "link", "toId": "fetch", "type": "NEXT"}));
    let path = ws.write("derive_arms.json", &doc);
    let output = cargo_bin_cmd!("derive")
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .get_output()
        .clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("error:"));
}

#[test]
fn plan_builds_cypher_offline() {
    let ws = Workspace::new();
    let schema = ws.write("derive_arms.json", &method_doc());
    let request = ws.write(
        "request.json",
        &json!({
            "classes": ["Subject", "Treatment Arm"],
            "where_map": {"Treatment Arm": {"rdfs:label": ["A", "B"]}},
            "options": {"infer_rels": true, "limit": 5}
        }),
    );
    let output = cargo_bin_cmd!("derive")
        .args(["--format", "json", "plan"])
        .arg(&request)
        .arg("--schema")
        .arg(&schema)
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    let text = json["text"].as_str().expect("text");
    assert!(text.contains("(`SUBJ`)-[:`Treatment Arm`]->(`ARM`)"));
    assert!(text.ends_with("LIMIT 5"));
    assert_eq!(json["params"]["par_1"], json!(["A", "B"]));
    assert_eq!(
        json["columns"],
        json!(["SUBJ", "_id_SUBJ", "ARM", "_id_ARM"])
    );
    assert_eq!(json["hash"].as_str().map(str::len), Some(16));
}

#[test]
fn plan_reports_invalid_requests() {
    let ws = Workspace::new();
    let request = ws.write("request.json", &json!({"classes": ["Subject"], "options": {"limit": 0}}));
    cargo_bin_cmd!("derive")
        .arg("plan")
        .arg(&request)
        .assert()
        .failure()
        .code(1);
}

#[test]
fn run_fails_when_the_store_is_unreachable() {
    let ws = Workspace::new();
    let output = cargo_bin_cmd!("derive")
        .arg("--config")
        .arg(ws.config())
        .env("DERIVATION_STORE_URL", UNREACHABLE)
        .args(["run", "derive_arms", "--dry-run"])
        .assert()
        .failure()
        .code(1)
        .get_output()
        .clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("error:"));
}

#[test]
fn rollback_of_an_empty_log_needs_no_store_access() {
    let ws = Workspace::new();
    let log = ws.write("derive_arms.rollback.json", &json!({"root": "derive_arms", "entries": []}));
    let output = cargo_bin_cmd!("derive")
        .arg("--config")
        .arg(ws.config())
        .env("DERIVATION_STORE_URL", UNREACHABLE)
        .args(["--format", "json", "rollback"])
        .arg(&log)
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["root"], "derive_arms");
    assert_eq!(json["entries"], 0);
    assert_eq!(json["failures"], json!([]));
}

#[test]
fn rollback_failures_exit_with_a_distinct_status() {
    let ws = Workspace::new();
    let log = ws.write(
        "derive_arms.rollback.json",
        &json!({
            "root": "derive_arms",
            "entries": [{
                "action_id": "link",
                "kind": "link",
                "applied_at": "2024-03-01T12:00:00Z",
                "writes": [{"op": "delete_edges", "edges": [7]}]
            }]
        }),
    );
    cargo_bin_cmd!("derive")
        .arg("--config")
        .arg(ws.config())
        .env("DERIVATION_STORE_URL", UNREACHABLE)
        .arg("rollback")
        .arg(&log)
        .assert()
        .failure()
        .code(2);
}

#[test]
fn import_requires_a_study() {
    let ws = Workspace::new();
    let doc = ws.write("derive_arms.json", &method_doc());
    cargo_bin_cmd!("derive")
        .arg("--config")
        .arg(ws.path().join("missing.toml"))
        .arg("import")
        .arg(&doc)
        .assert()
        .failure()
        .code(2);
}
