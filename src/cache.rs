//! Content-addressed cache for the strip/compact binary processing step.
//!
//! Keyed by (absolute source path, strip flag, compact flag) and validated
//! by a SHA256 digest of the source contents, so a touched-but-unchanged
//! binary does not get stripped again. The cache is read-check-then-write
//! with no cross-process locking; one build runs at a time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::fsutil;
use crate::process::Cmd;

const INDEX_NAME: &str = "index.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: HashMap<String, CachedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    /// SHA256 of the source file when the cached copy was produced.
    digest: String,
    /// File name of the processed copy inside the cache directory.
    file: String,
}

/// On-disk cache of stripped/compacted binaries.
pub struct BinaryCache {
    dir: PathBuf,
    index: CacheIndex,
}

impl BinaryCache {
    /// Open (or initialize) the cache at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        let index_path = dir.join(INDEX_NAME);
        let index = if index_path.exists() {
            match fs::read_to_string(&index_path)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
            {
                Some(index) => index,
                None => {
                    eprintln!(
                        "  [WARN] Unreadable cache index {}, starting fresh",
                        index_path.display()
                    );
                    CacheIndex::default()
                }
            }
        } else {
            CacheIndex::default()
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
        })
    }

    /// Run `source` through the requested processing, memoized.
    ///
    /// Returns the path to ship: the cached processed copy, or `source`
    /// itself when no processing applies. Tool failures are warnings; the
    /// unprocessed copy is shipped instead.
    pub fn process(
        &mut self,
        config: &BuildConfig,
        source: &Path,
        strip: bool,
        compact: bool,
        compact_exclude: &[String],
    ) -> Result<PathBuf> {
        let compact = compact && config.has_compactor && !is_excluded(source, compact_exclude);
        if !strip && !compact {
            return Ok(source.to_path_buf());
        }

        let abs = source
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", source.display()))?;
        let digest = digest_file(&abs)?;
        let key = format!("{}|strip={}|compact={}", abs.display(), strip, compact);

        if let Some(cached) = self.index.entries.get(&key) {
            let path = self.dir.join(&cached.file);
            if cached.digest == digest && path.exists() {
                return Ok(path);
            }
        }

        let base = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "binary".to_string());
        let file = format!("{}-{}", &digest[..16], base);
        let dest = self.dir.join(&file);
        // fs::copy carries the permission bits over.
        fs::copy(&abs, &dest)
            .with_context(|| format!("Failed to copy {} into the cache", abs.display()))?;

        if strip {
            run_tool(Cmd::new("strip").arg_path(&dest), "strip", &dest);
        }
        if compact {
            run_tool(Cmd::new("upx").arg("--best").arg("-q").arg_path(&dest), "upx", &dest);
        }

        self.index.entries.insert(key, CachedEntry { digest, file });
        self.write_index()?;
        Ok(dest)
    }

    fn write_index(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.index)?;
        fsutil::write_file_with_dirs(self.dir.join(INDEX_NAME), json)
    }
}

/// Run a processing tool, downgrading any failure to a warning.
fn run_tool(cmd: Cmd, tool: &str, target: &Path) {
    match cmd.allow_fail().run() {
        Ok(result) if !result.success() => {
            eprintln!(
                "  [WARN] {} failed on {} (exit code {}), shipping unprocessed copy",
                tool,
                target.display(),
                result.code()
            );
        }
        Err(e) => {
            eprintln!(
                "  [WARN] Could not run {} on {}: {}",
                tool,
                target.display(),
                e
            );
        }
        Ok(_) => {}
    }
}

fn is_excluded(source: &Path, exclude: &[String]) -> bool {
    let base = source.file_name().map(|n| n.to_string_lossy().into_owned());
    match base {
        Some(base) => exclude.iter().any(|e| e == &base),
        None => false,
    }
}

/// SHA256 of a file's contents as lowercase hex.
pub fn digest_file(path: &Path) -> Result<String> {
    let content = fs::read(path)
        .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}
