//! The module archive (`.fpz`): every pure interpreted-code module of a
//! program in one compressed, optionally encrypted container.
//!
//! Bootstrap modules are the import machinery that reads this archive at run
//! time, so they cannot live inside it. They are carved out here, compiled
//! into the work directory, and exposed as this node's dependency set; the
//! container archive embeds them directly.

use anyhow::{bail, Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::archive::cipher::ArchiveCipher;
use crate::code::{self, CodeObject, ModuleCompiler};
use crate::config::BuildConfig;
use crate::target::{self, Outcome, Target};
use crate::toc::{BuiltArtifact, Entry, EntryKind, Toc};

/// Magic at offset 0 of a module archive.
pub const ARCHIVE_MAGIC: &[u8; 4] = b"FPZ\0";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Archive-level flag: payloads are encrypted.
pub const FLAG_ENCRYPTED: u32 = 1;

/// Per-entry flag bits.
pub const ENTRY_COMPRESSED: u8 = 1;
pub const ENTRY_ENCRYPTED: u8 = 1 << 1;

/// Name of the generated key module. Sorts before every other bootstrap
/// module and depends on nothing, so it is always importable first.
pub const KEY_MODULE_NAME: &str = "fp00_archive_key";

const HEADER_LEN: u64 = 20;

/// Options for a module archive node.
#[derive(Default)]
pub struct ModuleArchiveOptions {
    /// Output path; defaults to `<workpath>/modules.fpz`.
    pub name: Option<PathBuf>,
    /// Payload encryption. When set, a generated key module is inserted as
    /// the first bootstrap entry.
    pub cipher: Option<ArchiveCipher>,
}

/// Build node producing a module archive.
pub struct ModuleArchive<'a> {
    config: BuildConfig,
    toc: Toc,
    code_cache: HashMap<String, CodeObject>,
    name: PathBuf,
    cipher: Option<ArchiveCipher>,
    dependencies: Toc,
    compiler: &'a dyn ModuleCompiler,
}

#[derive(Serialize, Deserialize, PartialEq)]
pub struct ModuleArchiveFields {
    name: PathBuf,
    toc: Toc,
    encrypted: bool,
}

impl<'a> ModuleArchive<'a> {
    /// Merge one or more module manifests into an archive node.
    ///
    /// `bootstrap` is the externally-supplied set of import-machinery
    /// modules; they are compiled into the work directory immediately and
    /// excluded from the archive itself.
    pub fn new(
        config: &BuildConfig,
        tocs: &[Toc],
        bootstrap: &Toc,
        compiler: &'a dyn ModuleCompiler,
        options: ModuleArchiveOptions,
    ) -> Result<Self> {
        let mut toc = Toc::new();
        for t in tocs {
            toc.extend(t);
        }
        let name = options
            .name
            .unwrap_or_else(|| config.workpath.join("modules.fpz"));

        let mut bootstrap = bootstrap.clone();
        if let Some(cipher) = &options.cipher {
            let key_source = write_key_module(config, cipher)?;
            let mut with_key = Toc::new();
            with_key.push(Entry::new(KEY_MODULE_NAME, &key_source, EntryKind::Module));
            with_key.extend(&bootstrap);
            bootstrap = with_key;
        }
        let dependencies = code::compile_to_workpath(compiler, &config.workpath, &bootstrap)?;

        Ok(Self {
            config: config.clone(),
            toc,
            code_cache: HashMap::new(),
            name,
            cipher: options.cipher,
            dependencies,
            compiler,
        })
    }

    /// Seed the node with code objects the upstream analysis already holds,
    /// so those modules skip recompilation.
    pub fn with_code_cache(mut self, cache: HashMap<String, CodeObject>) -> Self {
        self.code_cache = cache;
        self
    }

    /// The compiled bootstrap modules a downstream container must embed.
    pub fn dependencies(&self) -> &Toc {
        &self.dependencies
    }

    pub fn build(&mut self) -> Result<Outcome> {
        target::build(self)
    }

    /// This node's output as input for a downstream assembler.
    pub fn artifact(&self) -> BuiltArtifact {
        BuiltArtifact {
            name: self
                .name
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "modules.fpz".to_string()),
            path: self.name.clone(),
            kind: EntryKind::Archive,
            dependencies: self.dependencies.clone(),
        }
    }
}

impl Target for ModuleArchive<'_> {
    type Fields = ModuleArchiveFields;

    fn kind_name(&self) -> &'static str {
        "FPZ"
    }

    fn output_path(&self) -> &Path {
        &self.name
    }

    fn record_path(&self) -> PathBuf {
        target::record_path_for(&self.config.workpath, self.kind_name(), &self.name)
    }

    fn tracked_fields(&self) -> ModuleArchiveFields {
        ModuleArchiveFields {
            name: self.name.clone(),
            toc: self.toc.clone(),
            encrypted: self.cipher.is_some(),
        }
    }

    fn input_files(&self) -> Vec<PathBuf> {
        self.toc
            .iter()
            .filter(|e| !e.path.as_os_str().is_empty())
            .map(|e| e.path.clone())
            .collect()
    }

    fn assemble(&mut self) -> Result<()> {
        // The bootstrap modules are embedded by the container archive, not
        // bundled here.
        let toc = self.toc.subtract(&self.dependencies);

        let mut items: Vec<(String, CodeObject)> = Vec::new();
        for entry in &toc {
            if entry.kind != EntryKind::Module {
                eprintln!(
                    "  [WARN] '{}' is not an interpreted module, excluding it from {}",
                    entry.name,
                    self.name.display()
                );
                continue;
            }
            let code = match self.code_cache.get(&entry.name) {
                Some(code) => code.clone(),
                None => match code::get_code_object(self.compiler, &entry.name, &entry.path) {
                    Ok(code) => code,
                    Err(e) => {
                        // Source the target runtime cannot compile; the
                        // archive build never aborts for one bad module.
                        eprintln!(
                            "  [WARN] Could not compile module '{}': {:#}. Excluding it.",
                            entry.name, e
                        );
                        continue;
                    }
                },
            };
            items.push((entry.name.clone(), code));
        }

        // Alphabetical order makes the archive reproducible.
        items.sort_by(|a, b| a.0.cmp(&b.0));

        let prefixes = [self.config.specpath.as_path(), self.config.workpath.as_path()];
        for (_, code) in &mut items {
            code.strip_origin_prefixes(&prefixes);
        }

        write_archive(&self.name, &items, self.cipher.as_ref())
    }
}

/// Generate the key module's source in the work directory.
fn write_key_module(config: &BuildConfig, cipher: &ArchiveCipher) -> Result<PathBuf> {
    let path = config.workpath.join(format!("{KEY_MODULE_NAME}.src"));
    let source = format!("ARCHIVE_KEY = \"{}\"\n", cipher.key_hex());
    crate::fsutil::write_file_with_dirs(&path, source)?;
    Ok(path)
}

// =============================================================================
// Writer / reader
// =============================================================================

fn write_archive(
    path: &Path,
    items: &[(String, CodeObject)],
    cipher: Option<&ArchiveCipher>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create module archive {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let archive_flags = if cipher.is_some() { FLAG_ENCRYPTED } else { 0 };
    out.write_all(ARCHIVE_MAGIC)?;
    out.write_all(&FORMAT_VERSION.to_be_bytes())?;
    out.write_all(&archive_flags.to_be_bytes())?;
    out.write_all(&0u64.to_be_bytes())?; // index offset, patched below

    let mut offset = HEADER_LEN;
    let mut index: Vec<(String, u64, u32, u8)> = Vec::with_capacity(items.len());
    for (name, code) in items {
        let mut payload = compress(&code.to_bytes())?;
        let mut flags = ENTRY_COMPRESSED;
        if let Some(cipher) = cipher {
            payload = cipher.encrypt(name, &payload);
            flags |= ENTRY_ENCRYPTED;
        }
        index.push((name.clone(), offset, payload.len() as u32, flags));
        out.write_all(&payload)?;
        offset += payload.len() as u64;
    }

    let index_offset = offset;
    out.write_all(&(index.len() as u32).to_be_bytes())?;
    for (name, entry_offset, length, flags) in &index {
        let name_bytes = name.as_bytes();
        out.write_all(&(name_bytes.len() as u16).to_be_bytes())?;
        out.write_all(name_bytes)?;
        out.write_all(&entry_offset.to_be_bytes())?;
        out.write_all(&length.to_be_bytes())?;
        out.write_all(&[*flags])?;
    }

    out.flush()?;
    let mut file = out.into_inner()?;
    file.seek(SeekFrom::Start(12))?;
    file.write_all(&index_offset.to_be_bytes())?;
    Ok(())
}

/// One index entry of a module archive.
#[derive(Debug, Clone)]
pub struct ModuleIndexEntry {
    pub name: String,
    pub offset: u64,
    pub length: u32,
    pub flags: u8,
}

/// Read the archive-level flags and the index back from a module archive.
pub fn read_index(path: &Path) -> Result<(u32, Vec<ModuleIndexEntry>)> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open module archive {}", path.display()))?;
    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)
        .context("Module archive shorter than its header")?;
    if &header[..4] != ARCHIVE_MAGIC {
        bail!("{} is not a module archive", path.display());
    }
    let version = u32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));
    if version != FORMAT_VERSION {
        bail!("Unsupported module archive version {version}");
    }
    let flags = u32::from_be_bytes(header[8..12].try_into().expect("4 bytes"));
    let index_offset = u64::from_be_bytes(header[12..20].try_into().expect("8 bytes"));

    file.seek(SeekFrom::Start(index_offset))?;
    let mut rest = Vec::new();
    file.read_to_end(&mut rest)?;
    let mut cursor = 0usize;
    let count = read_u32(&rest, &mut cursor)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = read_u16(&rest, &mut cursor)? as usize;
        if rest.len() < cursor + name_len {
            bail!("Truncated module archive index");
        }
        let name = String::from_utf8(rest[cursor..cursor + name_len].to_vec())
            .context("Module name is not UTF-8")?;
        cursor += name_len;
        let offset = read_u64(&rest, &mut cursor)?;
        let length = read_u32(&rest, &mut cursor)?;
        let flags = *rest
            .get(cursor)
            .context("Truncated module archive index")?;
        cursor += 1;
        entries.push(ModuleIndexEntry {
            name,
            offset,
            length,
            flags,
        });
    }
    Ok((flags, entries))
}

/// Extract and decode one module. The caller supplies the cipher for
/// encrypted archives.
pub fn read_module(
    path: &Path,
    name: &str,
    cipher: Option<&ArchiveCipher>,
) -> Result<CodeObject> {
    let (_, entries) = read_index(path)?;
    let entry = entries
        .iter()
        .find(|e| e.name == name)
        .with_context(|| format!("Module '{name}' not found in {}", path.display()))?;

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(entry.offset))?;
    let mut payload = vec![0u8; entry.length as usize];
    file.read_exact(&mut payload)?;

    if entry.flags & ENTRY_ENCRYPTED != 0 {
        let cipher = cipher.context("Archive is encrypted but no cipher was supplied")?;
        payload = cipher.decrypt(&payload)?;
    }
    if entry.flags & ENTRY_COMPRESSED != 0 {
        payload = decompress(&payload)?;
    }
    CodeObject::from_bytes(&payload)
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn read_u16(data: &[u8], cursor: &mut usize) -> Result<u16> {
    let end = *cursor + 2;
    if data.len() < end {
        bail!("Truncated module archive index");
    }
    let value = u16::from_be_bytes(data[*cursor..end].try_into().expect("2 bytes"));
    *cursor = end;
    Ok(value)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = *cursor + 4;
    if data.len() < end {
        bail!("Truncated module archive index");
    }
    let value = u32::from_be_bytes(data[*cursor..end].try_into().expect("4 bytes"));
    *cursor = end;
    Ok(value)
}

fn read_u64(data: &[u8], cursor: &mut usize) -> Result<u64> {
    let end = *cursor + 8;
    if data.len() < end {
        bail!("Truncated module archive index");
    }
    let value = u64::from_be_bytes(data[*cursor..end].try_into().expect("8 bytes"));
    *cursor = end;
    Ok(value)
}
