//! Compiled-module representation and the compiler seam.
//!
//! The runtime toolchain that turns module source into executable code lives
//! outside this crate; `ModuleCompiler` is the boundary. A `CodeObject` is
//! one compiled module together with the origin path its runtime error
//! messages will report.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fsutil;
use crate::toc::{Entry, EntryKind, Toc};

/// Magic + version prefix of a serialized code object.
pub const CODE_MAGIC: &[u8; 4] = b"FPC\x01";

/// File extension of serialized code objects.
pub const CODE_EXT: &str = "fpc";

/// One compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeObject {
    /// Source path recorded for runtime diagnostics.
    pub origin: String,
    /// Opaque compiled representation, produced and consumed by the runtime.
    pub code: Vec<u8>,
}

impl CodeObject {
    pub fn new(origin: impl Into<String>, code: Vec<u8>) -> Self {
        Self {
            origin: origin.into(),
            code,
        }
    }

    /// Serialize: magic, u16 origin length, origin, u32 code length, code.
    /// Integers are big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let origin = self.origin.as_bytes();
        let mut out = Vec::with_capacity(4 + 2 + origin.len() + 4 + self.code.len());
        out.extend_from_slice(CODE_MAGIC);
        out.extend_from_slice(&(origin.len() as u16).to_be_bytes());
        out.extend_from_slice(origin);
        out.extend_from_slice(&(self.code.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.code);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 || &bytes[..4] != CODE_MAGIC {
            bail!("Not a serialized code object");
        }
        let origin_len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        let code_start = 6 + origin_len + 4;
        if bytes.len() < code_start {
            bail!("Truncated code object header");
        }
        let origin = String::from_utf8(bytes[6..6 + origin_len].to_vec())
            .context("Code object origin is not UTF-8")?;
        let code_len = u32::from_be_bytes(
            bytes[6 + origin_len..code_start]
                .try_into()
                .expect("slice is 4 bytes"),
        ) as usize;
        if bytes.len() < code_start + code_len {
            bail!("Truncated code object payload");
        }
        let code = bytes[code_start..code_start + code_len].to_vec();
        Ok(Self { origin, code })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read code object {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fsutil::write_file_with_dirs(path, self.to_bytes())
    }

    /// Strip build-machine path prefixes out of the origin, so runtime error
    /// messages do not leak build-environment paths and output stays
    /// byte-identical across machines. The longest matching prefix wins.
    pub fn strip_origin_prefixes(&mut self, prefixes: &[&Path]) {
        let origin = Path::new(&self.origin);
        let mut best: Option<PathBuf> = None;
        for prefix in prefixes {
            if let Ok(rel) = origin.strip_prefix(prefix) {
                let keep = match &best {
                    Some(prev) => rel.as_os_str().len() < prev.as_os_str().len(),
                    None => true,
                };
                if keep && !rel.as_os_str().is_empty() {
                    best = Some(rel.to_path_buf());
                }
            }
        }
        if let Some(rel) = best {
            self.origin = rel.to_string_lossy().into_owned();
        }
    }
}

/// Boundary to the external runtime toolchain that compiles module source.
pub trait ModuleCompiler {
    /// Compile one module from its source file. Failure means the source is
    /// not valid for the target runtime.
    fn compile(&self, name: &str, source: &Path) -> Result<CodeObject>;
}

/// Load a module's code: precompiled files are read back directly, anything
/// else goes through the compiler.
pub fn get_code_object(
    compiler: &dyn ModuleCompiler,
    name: &str,
    path: &Path,
) -> Result<CodeObject> {
    if path.extension().and_then(|e| e.to_str()) == Some(CODE_EXT) {
        CodeObject::read(path)
    } else {
        compiler.compile(name, path)
    }
}

/// Compile a set of module entries into the work directory and return a
/// manifest pointing at the compiled files.
///
/// This is how the bootstrap modules get routed around the module archive:
/// compiled here, embedded directly by the container archive.
pub fn compile_to_workpath(
    compiler: &dyn ModuleCompiler,
    workpath: &Path,
    toc: &Toc,
) -> Result<Toc> {
    let mut compiled = Toc::new();
    for entry in toc {
        let code = get_code_object(compiler, &entry.name, &entry.path)
            .with_context(|| format!("Failed to compile bootstrap module '{}'", entry.name))?;
        let out = workpath.join(format!("{}.{}", entry.name, CODE_EXT));
        code.write(&out)?;
        compiled.push(Entry::new(&entry.name, &out, EntryKind::Module));
    }
    Ok(compiled)
}
