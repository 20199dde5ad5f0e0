//! Shared test utilities for frostpack tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use frostpack::code::{CodeObject, ModuleCompiler};
use frostpack::{BuildConfig, Platform};

/// Marker that makes `MockCompiler` reject a source file.
pub const BAD_SYNTAX_MARKER: &str = "%%bad-syntax%%";

/// Test environment with a temporary build tree.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub config: BuildConfig,
    /// Directory for mock source and data files.
    pub src: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_platform(Platform::Linux)
    }

    pub fn with_platform(platform: Platform) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let mut config = BuildConfig::new(
            base.join("build"),
            base.join("dist"),
            base.join("spec"),
            base.join("bootloader"),
            platform,
            "libruntime.so.1",
        )
        .expect("Failed to create build config");
        // Keep the cache inside the test tree and make compaction
        // deterministic regardless of what the host has installed.
        config.cache_dir = base.join("cache");
        config.has_compactor = false;

        let src = base.join("src");
        fs::create_dir_all(&src).expect("Failed to create src dir");
        fs::create_dir_all(&config.specpath).expect("Failed to create spec dir");

        Self {
            _temp_dir: temp_dir,
            config,
            src,
        }
    }

    /// Write a mock source/data file and return its path.
    pub fn write_source(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.src.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create source subdir");
        }
        fs::write(&path, contents).expect("Failed to write source file");
        path
    }

    /// Install a mock prebuilt bootstrap binary for the configured
    /// platform (`variant` is e.g. "run" or "runw.exe").
    pub fn install_bootstrap(&self, variant: &str, contents: &[u8]) -> PathBuf {
        let dir = self
            .config
            .bootloader_dir
            .join(self.config.platform.dir_name());
        fs::create_dir_all(&dir).expect("Failed to create bootloader dir");
        let path = dir.join(variant);
        fs::write(&path, contents).expect("Failed to write bootstrap binary");
        path
    }
}

/// Compiler standing in for the external runtime toolchain: the "compiled"
/// representation is simply the source bytes. Sources containing
/// `BAD_SYNTAX_MARKER` are rejected the way a real compiler rejects syntax
/// the target runtime does not support.
pub struct MockCompiler;

impl ModuleCompiler for MockCompiler {
    fn compile(&self, name: &str, source: &Path) -> anyhow::Result<CodeObject> {
        let text = fs::read_to_string(source)?;
        if text.contains(BAD_SYNTAX_MARKER) {
            anyhow::bail!("Syntax not supported by the target runtime in module '{name}'");
        }
        Ok(CodeObject::new(
            source.to_string_lossy().into_owned(),
            text.into_bytes(),
        ))
    }
}
