//! Filesystem helpers shared across the pipeline stages.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Stream-copy a file, creating the destination's parent directories.
///
/// Unlike `fs::copy` this does not carry permissions over; use
/// `copy_file_with_metadata` when they matter.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut reader = fs::File::open(src)
        .with_context(|| format!("Failed to open {} for copying", src.display()))?;
    let mut writer = fs::File::create(dst)
        .with_context(|| format!("Failed to create {}", dst.display()))?;
    let bytes = io::copy(&mut reader, &mut writer)?;
    Ok(bytes)
}

/// Copy a file and then its permission bits. A metadata failure after a
/// successful content copy is reported as a warning, not an error.
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<()> {
    copy_file(src, dst)?;
    if let Err(e) = copy_permissions(src, dst) {
        eprintln!(
            "  [WARN] Failed to copy metadata of {}: {}",
            src.display(),
            e
        );
    }
    Ok(())
}

/// Recursively copy a directory tree, preserving permission bits.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for item in WalkDir::new(src) {
        let item = item?;
        let rel = item
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);
        if item.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            if let Err(e) = copy_permissions(item.path(), &target) {
                eprintln!(
                    "  [WARN] Failed to copy metadata of {}: {}",
                    item.path().display(),
                    e
                );
            }
        } else {
            copy_file_with_metadata(item.path(), &target)?;
        }
    }
    Ok(())
}

/// Transfer permission bits from one path to another.
pub fn copy_permissions(src: &Path, dst: &Path) -> Result<()> {
    let perms = fs::metadata(src)?.permissions();
    fs::set_permissions(dst, perms)?;
    Ok(())
}

/// Mark a file executable (rwxr-xr-x).
pub fn mark_executable(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to mark {} executable", path.display()))?;
    Ok(())
}

/// True when `path` sits inside an already-packaged library bundle. Such
/// files are not shipped individually; the bundle travels as a whole and the
/// runtime resolves into it.
pub fn is_bundled_library_path(path: &Path) -> bool {
    path.ancestors().skip(1).any(|ancestor| {
        ancestor
            .extension()
            .map(|ext| ext == "bundle")
            .unwrap_or(false)
    })
}

/// Modification time as unix seconds, or None when the file is missing or
/// the platform cannot report it.
pub fn mtime(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let elapsed = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(elapsed.as_secs())
}

/// A temporary file that is removed when the value is dropped, so every
/// exit path of the caller cleans up.
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Reserve a fresh scratch path in `dir`, named after `prefix`.
    pub fn create(dir: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let pid = std::process::id();
        for n in 0u32.. {
            let candidate = dir.join(format!("{prefix}.{pid}.{n}.tmp"));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(_) => return Ok(Self { path: candidate }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create scratch file in {}", dir.display())
                    })
                }
            }
        }
        unreachable!("scratch file namespace exhausted");
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
