//! Build node staleness tests: rebuilds happen exactly when a tracked
//! input changed.

mod helpers;

use helpers::TestEnv;

use anyhow::Result;
use frostpack::target::{self, Outcome, Target};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, PartialEq, Clone)]
struct NodeFields {
    tag: String,
}

/// Minimal node: assembly writes a marker file and counts invocations.
struct TestNode {
    workpath: PathBuf,
    output: PathBuf,
    fields: NodeFields,
    inputs: Vec<PathBuf>,
    always: bool,
    assembled: u32,
}

impl TestNode {
    fn new(env: &TestEnv) -> Self {
        Self {
            workpath: env.config.workpath.clone(),
            output: env.config.workpath.join("artifact.out"),
            fields: NodeFields { tag: "v1".into() },
            inputs: Vec::new(),
            always: false,
            assembled: 0,
        }
    }
}

impl Target for TestNode {
    type Fields = NodeFields;

    fn kind_name(&self) -> &'static str {
        "TEST"
    }

    fn output_path(&self) -> &Path {
        &self.output
    }

    fn record_path(&self) -> PathBuf {
        target::record_path_for(&self.workpath, self.kind_name(), &self.output)
    }

    fn tracked_fields(&self) -> NodeFields {
        self.fields.clone()
    }

    fn input_files(&self) -> Vec<PathBuf> {
        self.inputs.clone()
    }

    fn always_stale(&self) -> bool {
        self.always
    }

    fn assemble(&mut self) -> Result<()> {
        self.assembled += 1;
        fs::write(&self.output, "artifact")?;
        Ok(())
    }
}

/// Rewrite the saved record with `built_at` moved into the past, sidestepping
/// mtime granularity in the tests below.
fn age_record(record_path: &Path, seconds: u64) {
    let content = fs::read_to_string(record_path).unwrap();
    let mut record: serde_json::Value = serde_json::from_str(&content).unwrap();
    let built_at = record["built_at"].as_u64().unwrap();
    record["built_at"] = serde_json::Value::from(built_at - seconds);
    fs::write(record_path, serde_json::to_string(&record).unwrap()).unwrap();
}

#[test]
fn test_second_build_does_no_work() {
    let env = TestEnv::new();
    let mut node = TestNode::new(&env);

    assert_eq!(target::build(&mut node).unwrap(), Outcome::Built);
    assert_eq!(target::build(&mut node).unwrap(), Outcome::Skipped);
    assert_eq!(node.assembled, 1);
}

#[test]
fn test_rebuild_when_output_missing() {
    let env = TestEnv::new();
    let mut node = TestNode::new(&env);

    target::build(&mut node).unwrap();
    fs::remove_file(&node.output).unwrap();
    assert_eq!(target::build(&mut node).unwrap(), Outcome::Built);
    assert_eq!(node.assembled, 2);
}

#[test]
fn test_rebuild_when_tracked_field_changes() {
    let env = TestEnv::new();
    let mut node = TestNode::new(&env);

    target::build(&mut node).unwrap();
    node.fields.tag = "v2".into();
    assert_eq!(target::build(&mut node).unwrap(), Outcome::Built);

    // And the new value is persisted: a third build skips.
    assert_eq!(target::build(&mut node).unwrap(), Outcome::Skipped);
}

#[test]
fn test_rebuild_when_input_newer_than_record() {
    let env = TestEnv::new();
    let input = env.write_source("input.dat", "original");
    let mut node = TestNode::new(&env);
    node.inputs = vec![input.clone()];

    target::build(&mut node).unwrap();
    assert_eq!(target::build(&mut node).unwrap(), Outcome::Skipped);

    // Pretend the build happened a while ago, then touch the input.
    age_record(&node.record_path(), 100);
    fs::write(&input, "modified").unwrap();
    assert_eq!(target::build(&mut node).unwrap(), Outcome::Built);
    assert_eq!(node.assembled, 2);
}

#[test]
fn test_rebuild_when_record_version_changes() {
    let env = TestEnv::new();
    let mut node = TestNode::new(&env);

    target::build(&mut node).unwrap();
    let record_path = node.record_path();
    let content = fs::read_to_string(&record_path).unwrap();
    let mut record: serde_json::Value = serde_json::from_str(&content).unwrap();
    record["version"] = serde_json::Value::from(999);
    fs::write(&record_path, serde_json::to_string(&record).unwrap()).unwrap();

    assert_eq!(target::build(&mut node).unwrap(), Outcome::Built);
}

#[test]
fn test_rebuild_when_record_unreadable() {
    let env = TestEnv::new();
    let mut node = TestNode::new(&env);

    target::build(&mut node).unwrap();
    fs::write(node.record_path(), "not json").unwrap();
    assert_eq!(target::build(&mut node).unwrap(), Outcome::Built);
}

#[test]
fn test_always_stale_node_rebuilds_every_time() {
    let env = TestEnv::new();
    let mut node = TestNode::new(&env);
    node.always = true;

    target::build(&mut node).unwrap();
    target::build(&mut node).unwrap();
    target::build(&mut node).unwrap();
    assert_eq!(node.assembled, 3);
}
