//! Cross-build deduplication: when several executables are packaged
//! together, every shared binary or data file ships in exactly one of them.
//!
//! The first analysis keeps everything it owns. Later analyses lose any
//! entry whose absolute backing path was already claimed and instead gain a
//! dependency reference encoding a relative path back to the owning
//! executable, which the runtime resolves at load time.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::toc::{AnalysisTocs, Entry, EntryKind, Toc};

/// One executable's share of a multi-executable build: its analysis result,
/// an identifier it may be referenced under, and the on-disk name that
/// identifier resolves to.
pub struct MergeUnit {
    pub analysis: AnalysisTocs,
    pub id: String,
    pub target_path: String,
}

/// Rewrite the analyses so each distinct physical file is packaged once.
pub fn merge_dependencies(units: &mut [MergeUnit]) -> Result<()> {
    if units.is_empty() {
        return Ok(());
    }

    let primaries = units
        .iter()
        .map(primary_script)
        .collect::<Result<Vec<_>>>()?;
    let prefix = common_prefix_dir(&primaries);
    println!("  Common prefix: {prefix}");

    let overrides: HashMap<String, String> = units
        .iter()
        .map(|u| (u.id.clone(), u.target_path.clone()))
        .collect();
    let ids: Vec<String> = primaries
        .iter()
        .map(|p| derive_id(p, &prefix, &overrides))
        .collect();

    // Absolute backing path -> identifier of the executable that ships it.
    let mut owners: HashMap<PathBuf, String> = HashMap::new();
    for (unit, id) in units.iter_mut().zip(&ids) {
        let AnalysisTocs {
            binaries,
            datas,
            dependencies,
            ..
        } = &mut unit.analysis;
        dedup_toc(binaries, id, &mut owners, dependencies);
        dedup_toc(datas, id, &mut owners, dependencies);
    }
    Ok(())
}

/// The last script of an analysis is the primary program script.
fn primary_script(unit: &MergeUnit) -> Result<PathBuf> {
    let entry = unit
        .analysis
        .scripts
        .entries()
        .last()
        .context("Analysis has no primary script")?;
    std::path::absolute(&entry.path)
        .with_context(|| format!("Failed to resolve {}", entry.path.display()))
}

/// Stable relative identifier for one executable, derived from its primary
/// script path with the extension dropped, then mapped through the caller's
/// identifier overrides.
fn derive_id(primary: &Path, prefix: &str, overrides: &HashMap<String, String>) -> String {
    let full = primary.to_string_lossy();
    let rel = full.strip_prefix(prefix).unwrap_or(&full);
    let rel = match rel.rfind('.') {
        Some(dot) if !rel[dot..].contains('/') => &rel[..dot],
        _ => rel,
    };
    overrides
        .get(rel)
        .cloned()
        .unwrap_or_else(|| rel.to_string())
}

fn dedup_toc(
    toc: &mut Toc,
    id: &str,
    owners: &mut HashMap<PathBuf, String>,
    dependencies: &mut Toc,
) {
    let mut kept = Vec::new();
    for entry in toc.iter() {
        match owners.get(&entry.path) {
            None => {
                owners.insert(entry.path.clone(), id.to_string());
                kept.push(entry.clone());
            }
            Some(owner) => {
                let rel = relative_path(id, owner);
                dependencies.push(Entry::new(
                    format!("{rel}:{}", entry.name),
                    &entry.path,
                    EntryKind::Dependency,
                ));
            }
        }
    }
    *toc = Toc::from_entries(kept);
}

/// Longest common directory prefix over the primary script paths, with a
/// trailing separator.
fn common_prefix_dir(paths: &[PathBuf]) -> String {
    let strings: Vec<String> = paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let first = &strings[0];
    let mut len = first.len();
    for s in &strings[1..] {
        len = first
            .bytes()
            .zip(s.bytes())
            .take(len)
            .take_while(|(a, b)| a == b)
            .count();
    }
    while !first.is_char_boundary(len) {
        len -= 1;
    }
    match first[..len].rfind('/') {
        Some(i) => first[..=i].to_string(),
        None => String::new(),
    }
}

/// Relative path from one executable's identifier to another's: climb out
/// of the referrer's directory, then descend into the owner.
fn relative_path(from: &str, to: &str) -> String {
    let ups = from.matches('/').count();
    if ups == 0 {
        return to.to_string();
    }
    let mut parts: Vec<&str> = vec![".."; ups];
    parts.push(to);
    parts.join("/")
}
