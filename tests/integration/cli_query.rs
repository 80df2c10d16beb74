#![allow(missing_docs)]

mod support;

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use support::*;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    fixture: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let fixture = dir.path().join("store.json");
        fs::write(&fixture, fixture_json()).expect("write fixture");
        Self { dir, fixture }
    }

    fn request(&self, name: &str, tokens: Vec<Value>) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, request_json(tokens).to_string()).expect("write request");
        path
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("cohort");
        cmd.env("COHORT_CONFIG", self.dir.path().join("absent.toml"))
            .env("RUST_LOG", "warn")
            .arg("--fixture")
            .arg(&self.fixture);
        cmd
    }
}

fn fixture_json() -> String {
    fixture().to_string()
}

#[test]
fn query_prints_matched_profiles_as_json() {
    let ws = Workspace::new();
    let request = ws.request("age.json", age_in_village());
    let output = ws
        .cmd()
        .args(["--format", "json", "query", "--quiet"])
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let profiles: Value = serde_json::from_slice(&output).expect("valid json");
    let profiles = profiles.as_array().expect("profile array");
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0]["id"], json!("e1"));
    assert_eq!(profiles[0]["subregion"], json!("03217"));
}

#[test]
fn query_ndjson_emits_every_frame() {
    let ws = Workspace::new();
    let request = ws.request("age.json", age_in_village());
    let output = ws
        .cmd()
        .args(["query", "--ndjson"])
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf-8");
    let frames: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert!(frames.iter().any(|frame| frame.get("fetching").is_some()));
    assert!(frames.last().expect("frames").get("data").is_some());
}

#[test]
fn malformed_query_fails_with_message() {
    let ws = Workspace::new();
    let mut tokens = vec![choice("(")];
    tokens.extend(age_in_village());
    let request = ws.request("bad.json", tokens);
    let output = ws
        .cmd()
        .args(["query", "--quiet"])
        .arg(&request)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf-8");
    assert!(stderr.contains("error:"), "stderr: {stderr}");
    assert!(stderr.contains("unmatched"), "stderr: {stderr}");
}

#[test]
fn explain_renders_plan_tree() {
    let ws = Workspace::new();
    let request = ws.request("age.json", age_in_village());
    let output = ws
        .cmd()
        .arg("explain")
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf-8");
    assert!(text.starts_with("Query ["), "explain: {text}");
    assert!(text.contains("strategy=single-tree"));
    assert!(text.contains("fingerprint: "));
}

#[test]
fn fields_lists_labels() {
    let ws = Workspace::new();
    let output = ws
        .cmd()
        .args(["--format", "json", "fields"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let labels: Vec<String> = serde_json::from_slice(&output).expect("label list");
    assert!(labels.iter().any(|label| label == "Age"));
    assert!(labels.iter().any(|label| label == "Smoking"));
}
