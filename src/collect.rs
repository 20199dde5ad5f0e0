//! The directory assembler: lays the same inputs an executable takes out as
//! a directory tree under dist.
//!
//! Verifying an existing tree's integrity is not worth the complexity, so
//! this node is always stale: it wipes and recreates its output directory on
//! every build. Internal names are validated against path traversal before
//! anything is written.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::cache::BinaryCache;
use crate::config::BuildConfig;
use crate::fsutil;
use crate::target::{self, Outcome, Target};
use crate::toc::{flatten_inputs, EntryKind, NodeInput, Toc};

/// Options for a directory assembler node.
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Strip debug symbols from shared binaries.
    pub strip: bool,
    /// Run shared binaries through the size compactor.
    pub compact: bool,
    /// Binaries (by file name) the compactor must not touch.
    pub compact_exclude: Vec<String>,
}

/// Build node producing the output directory of a directory-mode build.
pub struct Collect {
    config: BuildConfig,
    name: PathBuf,
    toc: Toc,
    strip: bool,
    compact: bool,
    compact_exclude: Vec<String>,
}

#[derive(Serialize, Deserialize, PartialEq)]
pub struct CollectFields {
    name: PathBuf,
    toc: Toc,
}

impl Collect {
    /// `name` is the bare directory name; the tree is created under dist.
    pub fn new(
        config: &BuildConfig,
        name: &str,
        inputs: Vec<NodeInput>,
        options: CollectOptions,
    ) -> Self {
        let base = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        Self {
            config: config.clone(),
            name: config.distpath.join(base),
            toc: flatten_inputs(inputs),
            strip: options.strip,
            compact: options.compact,
            compact_exclude: options.compact_exclude,
        }
    }

    pub fn build(&mut self) -> Result<Outcome> {
        target::build(self)
    }
}

impl Target for Collect {
    type Fields = CollectFields;

    fn kind_name(&self) -> &'static str {
        "COLLECT"
    }

    fn output_path(&self) -> &Path {
        &self.name
    }

    fn record_path(&self) -> PathBuf {
        target::record_path_for(&self.config.workpath, self.kind_name(), &self.name)
    }

    fn tracked_fields(&self) -> CollectFields {
        CollectFields {
            name: self.name.clone(),
            toc: self.toc.clone(),
        }
    }

    fn input_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn always_stale(&self) -> bool {
        true
    }

    fn assemble(&mut self) -> Result<()> {
        let toc = crate::toc::normalize_extension_names(
            &self.toc,
            self.config.platform.shared_lib_suffix(),
        );

        // Validate every internal name before touching the filesystem; a
        // traversal attempt must not leave a half-written tree behind.
        for entry in &toc {
            if is_unsafe_name(&entry.name) {
                bail!(
                    "Refusing to place '{}' outside the output directory",
                    entry.name
                );
            }
        }

        if self.name.exists() {
            fs::remove_dir_all(&self.name)?;
        }
        fs::create_dir_all(&self.name)?;

        let mut cache = BinaryCache::open(&self.config.cache_dir)?;
        for entry in &toc {
            match entry.kind {
                // Directives carry no payload, and dependency references
                // are resolved at load time from the owning executable.
                EntryKind::Option | EntryKind::Dependency => continue,
                _ => {}
            }
            if !entry.path.exists() {
                if fsutil::is_bundled_library_path(&entry.path) {
                    continue;
                }
                bail!(
                    "No file at {} for entry '{}'",
                    entry.path.display(),
                    entry.name
                );
            }

            let dest = self.name.join(&entry.name);
            if let Some(parent) = dest.parent() {
                if parent.exists() && !parent.is_dir() {
                    bail!(
                        "Cannot create directory {}: a file already exists there",
                        parent.display()
                    );
                }
                fs::create_dir_all(parent)?;
            }

            let src = if entry.kind.is_binary() {
                cache.process(
                    &self.config,
                    &entry.path,
                    self.strip,
                    self.compact,
                    &self.compact_exclude,
                )?
            } else {
                entry.path.clone()
            };

            if src.is_dir() {
                fsutil::copy_tree(&src, &dest)?;
            } else {
                fsutil::copy_file_with_metadata(&src, &dest)?;
            }
            if entry.kind.is_binary() {
                fsutil::mark_executable(&dest)?;
            }
        }
        Ok(())
    }
}

/// True for internal names that would escape the output directory.
fn is_unsafe_name(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsafe_names() {
        assert!(is_unsafe_name("/etc/passwd"));
        assert!(is_unsafe_name("../outside"));
        assert!(is_unsafe_name("sub/../../outside"));
        assert!(!is_unsafe_name("sub/inside.txt"));
        assert!(!is_unsafe_name("dotted..name"));
    }
}
