//! Incremental build nodes and their persisted staleness records.
//!
//! Every artifact in the pipeline is a `Target`: it names its output, the
//! input fields it tracks, and the input files whose modification times
//! matter. `build()` is the only way a node's `assemble()` runs, and it
//! skips real work when nothing changed since the record was written.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fsutil;

/// Bump when the record layout changes; a mismatch forces a rebuild.
pub const RECORD_VERSION: u32 = 1;

/// Persisted snapshot of a node's tracked inputs, serialized as JSON next
/// to the node's output.
#[derive(Debug, Serialize, Deserialize)]
pub struct SavedRecord<F> {
    pub version: u32,
    /// Unix seconds when the node last assembled.
    pub built_at: u64,
    /// Modification time of the output right after that assembly.
    pub output_mtime: u64,
    /// The node's own typed field snapshot.
    pub fields: F,
}

/// An incrementally-built artifact.
pub trait Target {
    /// Typed snapshot of every tracked input field. Any field differing
    /// from the saved record makes the node stale.
    type Fields: Serialize + DeserializeOwned + PartialEq;

    /// Short kind tag for progress output ("FPZ", "FPK", "EXE", "COLLECT").
    fn kind_name(&self) -> &'static str;

    /// The output artifact this node owns.
    fn output_path(&self) -> &Path;

    /// Where the staleness record lives.
    fn record_path(&self) -> PathBuf;

    fn tracked_fields(&self) -> Self::Fields;

    /// Input files whose modification time newer than the last build makes
    /// the node stale. Missing files are ignored here; whether they are an
    /// error is the node's own business during assembly.
    fn input_files(&self) -> Vec<PathBuf>;

    /// Nodes that rebuild unconditionally return true.
    fn always_stale(&self) -> bool {
        false
    }

    /// Node-specific staleness beyond the generic checks. Returns the
    /// reason, or None when the node is current.
    fn extra_staleness(&self, record: &SavedRecord<Self::Fields>) -> Option<String> {
        let _ = record;
        None
    }

    /// Do the real work. Only ever called through `build()`.
    fn assemble(&mut self) -> Result<()>;
}

/// What `build()` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Built,
    Skipped,
}

/// Build a node: assemble only when stale, then persist a fresh record.
pub fn build<T: Target>(node: &mut T) -> Result<Outcome> {
    let record_path = node.record_path();
    let record = load_record::<T>(&record_path);

    let output_name = display_name(node.output_path());
    match staleness_reason(node, record.as_ref()) {
        None => {
            println!("  {} {} is up to date", node.kind_name(), output_name);
            Ok(Outcome::Skipped)
        }
        Some(reason) => {
            println!("Building {} {} ({})", node.kind_name(), output_name, reason);
            node.assemble()?;
            let record = SavedRecord {
                version: RECORD_VERSION,
                built_at: unix_now(),
                output_mtime: fsutil::mtime(node.output_path()).unwrap_or(0),
                fields: node.tracked_fields(),
            };
            let json = serde_json::to_string_pretty(&record)?;
            fsutil::write_file_with_dirs(&record_path, json).with_context(|| {
                format!("Failed to write build record {}", record_path.display())
            })?;
            Ok(Outcome::Built)
        }
    }
}

/// Conventional record location: `<workpath>/<kind>-<output name>.build.json`.
/// The kind tag keeps records apart when an executable, its inner archive,
/// and a collected directory share a base name.
pub fn record_path_for(workpath: &Path, kind: &str, output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    workpath.join(format!("{kind}-{name}.build.json"))
}

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn load_record<T: Target>(path: &Path) -> Option<SavedRecord<T::Fields>> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn staleness_reason<T: Target>(
    node: &T,
    record: Option<&SavedRecord<T::Fields>>,
) -> Option<String> {
    if node.always_stale() {
        return Some("always rebuilt".to_string());
    }
    if !node.output_path().exists() {
        return Some(format!("{} missing", display_name(node.output_path())));
    }
    let record = match record {
        Some(record) => record,
        None => return Some("no usable build record".to_string()),
    };
    if record.version != RECORD_VERSION {
        return Some("build record version changed".to_string());
    }
    if record.fields != node.tracked_fields() {
        return Some("tracked inputs changed".to_string());
    }
    for input in node.input_files() {
        if let Some(mtime) = fsutil::mtime(&input) {
            if mtime > record.built_at {
                return Some(format!("{} is newer than the last build", input.display()));
            }
        }
    }
    node.extra_staleness(record)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
