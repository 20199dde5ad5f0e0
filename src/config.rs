//! Build configuration passed explicitly into every pipeline component.
//!
//! One immutable value carries the paths and platform facts a build needs.
//! The upstream analysis resolves the runtime library name; this crate only
//! transports it into the container archive index.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::platform::Platform;

/// Immutable per-build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Scratch directory for intermediate artifacts and build records.
    pub workpath: PathBuf,
    /// Directory the final distributable lands in.
    pub distpath: PathBuf,
    /// Directory of the build description; relative input paths (icons,
    /// version resources) resolve against it.
    pub specpath: PathBuf,
    /// Directory holding the prebuilt bootstrap binaries, one subdirectory
    /// per platform.
    pub bootloader_dir: PathBuf,
    /// Location of the content-addressed strip/compact cache.
    pub cache_dir: PathBuf,
    /// Platform the build targets.
    pub platform: Platform,
    /// Base name of the runtime shared library, embedded in the container
    /// archive index so the bootstrap binary can locate it at process start.
    pub runtime_lib: String,
    /// Whether the size compactor was found on PATH.
    pub has_compactor: bool,
}

impl BuildConfig {
    /// Assemble a configuration, creating the work and dist directories.
    ///
    /// The compactor is probed once here; a build with `compact` enabled but
    /// no compactor installed quietly skips compaction.
    pub fn new(
        workpath: impl Into<PathBuf>,
        distpath: impl Into<PathBuf>,
        specpath: impl Into<PathBuf>,
        bootloader_dir: impl Into<PathBuf>,
        platform: Platform,
        runtime_lib: impl Into<String>,
    ) -> Result<Self> {
        let workpath = workpath.into();
        let distpath = distpath.into();
        fs::create_dir_all(&workpath)
            .with_context(|| format!("Failed to create work directory {}", workpath.display()))?;
        fs::create_dir_all(&distpath)
            .with_context(|| format!("Failed to create dist directory {}", distpath.display()))?;

        let cache_dir = default_cache_dir(&workpath);
        let has_compactor = which::which("upx").is_ok();

        Ok(Self {
            workpath,
            distpath,
            specpath: specpath.into(),
            bootloader_dir: bootloader_dir.into(),
            cache_dir,
            platform,
            runtime_lib: runtime_lib.into(),
            has_compactor,
        })
    }

    /// Resolve a path from the build description against `specpath`.
    pub fn resolve_spec_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.specpath.join(path)
        }
    }
}

/// Per-user cache directory, falling back to the work directory when the
/// platform reports none.
fn default_cache_dir(workpath: &Path) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| workpath.join("cache"))
        .join("frostpack")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_spec_path() {
        let config = BuildConfig {
            workpath: "/tmp/work".into(),
            distpath: "/tmp/dist".into(),
            specpath: "/project".into(),
            bootloader_dir: "/tmp/bootloader".into(),
            cache_dir: "/tmp/cache".into(),
            platform: Platform::Linux,
            runtime_lib: "librt.so.1".into(),
            has_compactor: false,
        };
        assert_eq!(
            config.resolve_spec_path(Path::new("icon.ico")),
            PathBuf::from("/project/icon.ico")
        );
        assert_eq!(
            config.resolve_spec_path(Path::new("/abs/icon.ico")),
            PathBuf::from("/abs/icon.ico")
        );
    }
}
