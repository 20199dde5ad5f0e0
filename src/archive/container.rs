//! The container archive (`.fpk`): one indexed binary container holding
//! modules, startup sources, shared libraries, data files and nested
//! archives. Its trailing cookie is the contract with the bootstrap binary,
//! which locates it by scanning backward from its own end of file.
//!
//! Startup sources and modules keep manifest order (the self-bootstrap
//! import sequence depends on it); every other entry is sorted by (type
//! code, name) so the byte layout is reproducible.

use anyhow::{bail, Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::cache::BinaryCache;
use crate::config::BuildConfig;
use crate::target::{self, Outcome, Target};
use crate::toc::{Entry, EntryKind, Toc};

/// Magic of the trailing cookie.
pub const COOKIE_MAGIC: &[u8; 8] = b"FPAK\r\n\x1a\n";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed cookie size: magic, version, archive length, index offset, index
/// length, runtime library name.
pub const COOKIE_LEN: usize = 8 + 4 + 4 + 4 + 4 + RUNTIME_LIB_LEN;

/// NUL-padded runtime library field width inside the cookie.
pub const RUNTIME_LIB_LEN: usize = 64;

/// Index entries are padded to a multiple of this.
const INDEX_ALIGN: usize = 16;

/// Fixed part of one index entry before the name field.
const INDEX_FIXED: usize = 18;

/// How far before end of file the backward cookie scan gives up.
const COOKIE_SCAN_WINDOW: u64 = 8192;

/// Per-kind compression switches. Defaults compress everything except the
/// nested module archive, which the bootstrap seeks into in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionMap(BTreeMap<EntryKind, bool>);

impl Default for CompressionMap {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for kind in [
            EntryKind::Module,
            EntryKind::Source,
            EntryKind::Extension,
            EntryKind::Binary,
            EntryKind::Data,
            EntryKind::Container,
            EntryKind::Zip,
            EntryKind::Executable,
        ] {
            map.insert(kind, true);
        }
        map.insert(EntryKind::Archive, false);
        Self(map)
    }
}

impl CompressionMap {
    pub fn set(&mut self, kind: EntryKind, compress: bool) {
        self.0.insert(kind, compress);
    }

    pub fn compresses(&self, kind: EntryKind) -> bool {
        self.0.get(&kind).copied().unwrap_or(false)
    }
}

/// Options for a container archive node.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    /// Output path; defaults to `<workpath>/bundle.fpk`.
    pub name: Option<PathBuf>,
    /// Per-kind compression; defaults per `CompressionMap::default`.
    pub compression: Option<CompressionMap>,
    /// Leave shared binaries out; a directory assembler ships them instead.
    pub exclude_binaries: bool,
    /// Strip debug symbols from shared binaries.
    pub strip: bool,
    /// Run shared binaries through the size compactor.
    pub compact: bool,
    /// Binaries (by file name) the compactor must not touch.
    pub compact_exclude: Vec<String>,
}

/// Build node producing a container archive.
pub struct ContainerArchive {
    config: BuildConfig,
    toc: Toc,
    name: PathBuf,
    compression: CompressionMap,
    exclude_binaries: bool,
    strip: bool,
    compact: bool,
    compact_exclude: Vec<String>,
}

#[derive(Serialize, Deserialize, PartialEq)]
pub struct ContainerFields {
    name: PathBuf,
    toc: Toc,
    compression: CompressionMap,
    exclude_binaries: bool,
    strip: bool,
    compact: bool,
    compact_exclude: Vec<String>,
}

impl ContainerArchive {
    pub fn new(config: &BuildConfig, toc: Toc, options: ContainerOptions) -> Self {
        Self {
            config: config.clone(),
            toc,
            name: options
                .name
                .unwrap_or_else(|| config.workpath.join("bundle.fpk")),
            compression: options.compression.unwrap_or_default(),
            exclude_binaries: options.exclude_binaries,
            strip: options.strip,
            compact: options.compact,
            compact_exclude: options.compact_exclude,
        }
    }

    pub fn build(&mut self) -> Result<Outcome> {
        target::build(self)
    }
}

impl Target for ContainerArchive {
    type Fields = ContainerFields;

    fn kind_name(&self) -> &'static str {
        "FPK"
    }

    fn output_path(&self) -> &Path {
        &self.name
    }

    fn record_path(&self) -> PathBuf {
        target::record_path_for(&self.config.workpath, self.kind_name(), &self.name)
    }

    fn tracked_fields(&self) -> ContainerFields {
        ContainerFields {
            name: self.name.clone(),
            toc: self.toc.clone(),
            compression: self.compression.clone(),
            exclude_binaries: self.exclude_binaries,
            strip: self.strip,
            compact: self.compact,
            compact_exclude: self.compact_exclude.clone(),
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
        let toc = crate::toc::normalize_extension_names(
            &self.toc,
            self.config.platform.shared_lib_suffix(),
        );

        let mut cache = BinaryCache::open(&self.config.cache_dir)?;
        let mut src_entries: Vec<PackEntry> = Vec::new();
        let mut other: Vec<PackEntry> = Vec::new();
        // Internal name -> first source path, and the reverse, for the two
        // duplicate-binary anomaly classes.
        let mut seen_names: HashMap<String, PathBuf> = HashMap::new();
        let mut seen_paths: HashMap<PathBuf, String> = HashMap::new();

        for entry in &toc {
            match entry.kind {
                EntryKind::Option => {
                    other.push(PackEntry::empty(&entry.name, entry.kind));
                }
                EntryKind::Source | EntryKind::Module => {
                    if skip_missing(entry)? {
                        continue;
                    }
                    // Startup order is semantically significant; keep
                    // manifest order exactly.
                    src_entries.push(PackEntry::file(
                        &entry.name,
                        entry.path.clone(),
                        entry.kind,
                        self.compression.compresses(entry.kind),
                    ));
                }
                EntryKind::Dependency => {
                    if self.exclude_binaries {
                        continue;
                    }
                    other.push(PackEntry::empty(&entry.name, entry.kind));
                }
                EntryKind::Binary | EntryKind::Extension => {
                    if self.exclude_binaries {
                        continue;
                    }
                    if skip_missing(entry)? {
                        continue;
                    }
                    if let Some(first) = seen_names.get(&entry.name) {
                        eprintln!(
                            "  [WARN] Two binaries added with the same internal name '{}': \
                             keeping {}, skipping {}",
                            entry.name,
                            first.display(),
                            entry.path.display()
                        );
                        continue;
                    }
                    if let Some(first_name) = seen_paths.get(&entry.path) {
                        eprintln!(
                            "  [WARN] {} added under two internal names ('{}' and '{}'), \
                             keeping both",
                            entry.path.display(),
                            first_name,
                            entry.name
                        );
                    }
                    seen_names.insert(entry.name.clone(), entry.path.clone());
                    seen_paths.insert(entry.path.clone(), entry.name.clone());

                    let processed = cache.process(
                        &self.config,
                        &entry.path,
                        self.strip,
                        self.compact,
                        &self.compact_exclude,
                    )?;
                    other.push(PackEntry::file(
                        &entry.name,
                        processed,
                        entry.kind,
                        self.compression.compresses(entry.kind),
                    ));
                }
                _ => {
                    if skip_missing(entry)? {
                        continue;
                    }
                    other.push(PackEntry::file(
                        &entry.name,
                        entry.path.clone(),
                        entry.kind,
                        self.compression.compresses(entry.kind),
                    ));
                }
            }
        }

        // Reproducible byte layout for everything whose order carries no
        // meaning.
        other.sort_by(|a, b| (a.code, a.name.as_str()).cmp(&(b.code, b.name.as_str())));
        src_entries.extend(other);

        write_container(&self.name, &src_entries, &self.config.runtime_lib)
    }
}

/// Returns Ok(true) when the entry should be silently skipped, and an error
/// when its backing file is missing with no bundle to explain it.
fn skip_missing(entry: &Entry) -> Result<bool> {
    if entry.path.is_file() {
        return Ok(false);
    }
    if crate::fsutil::is_bundled_library_path(&entry.path) {
        return Ok(true);
    }
    bail!(
        "No file at {} for entry '{}'",
        entry.path.display(),
        entry.name
    );
}

struct PackEntry {
    name: String,
    source: Option<PathBuf>,
    compress: bool,
    code: u8,
}

impl PackEntry {
    fn file(name: &str, source: PathBuf, kind: EntryKind, compress: bool) -> Self {
        Self {
            name: name.to_string(),
            source: Some(source),
            compress,
            code: kind.type_code(),
        }
    }

    fn empty(name: &str, kind: EntryKind) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            compress: false,
            code: kind.type_code(),
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

fn write_container(path: &Path, entries: &[PackEntry], runtime_lib: &str) -> Result<()> {
    if runtime_lib.len() >= RUNTIME_LIB_LEN {
        bail!("Runtime library name '{runtime_lib}' exceeds the cookie field");
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create container archive {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let mut offset: u64 = 0;
    let mut records: Vec<IndexEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        let data = match &entry.source {
            Some(source) => fs::read(source).with_context(|| {
                format!(
                    "Failed to read {} for entry '{}'",
                    source.display(),
                    entry.name
                )
            })?,
            None => Vec::new(),
        };
        let uncompressed_len = data.len() as u32;
        let (payload, compressed) = if entry.compress {
            (compress(&data)?, true)
        } else {
            (data, false)
        };
        records.push(IndexEntry {
            name: entry.name.clone(),
            offset: u32::try_from(offset).context("Container archive exceeds 4 GiB")?,
            compressed_len: payload.len() as u32,
            uncompressed_len,
            compressed,
            type_code: entry.code,
        });
        out.write_all(&payload)?;
        offset += payload.len() as u64;
    }

    let index_offset = u32::try_from(offset).context("Container archive exceeds 4 GiB")?;
    let mut index_len = 0u32;
    for record in &records {
        let name_bytes = record.name.as_bytes();
        let padded = pad_entry_len(name_bytes.len());
        out.write_all(&(padded as u32).to_be_bytes())?;
        out.write_all(&record.offset.to_be_bytes())?;
        out.write_all(&record.compressed_len.to_be_bytes())?;
        out.write_all(&record.uncompressed_len.to_be_bytes())?;
        out.write_all(&[record.compressed as u8])?;
        out.write_all(&[record.type_code])?;
        out.write_all(name_bytes)?;
        let padding = padded - INDEX_FIXED - name_bytes.len();
        out.write_all(&vec![0u8; padding])?;
        index_len += padded as u32;
    }

    // Trailing cookie, found by backward EOF scan.
    let archive_len = index_offset + index_len + COOKIE_LEN as u32;
    out.write_all(COOKIE_MAGIC)?;
    out.write_all(&FORMAT_VERSION.to_be_bytes())?;
    out.write_all(&archive_len.to_be_bytes())?;
    out.write_all(&index_offset.to_be_bytes())?;
    out.write_all(&index_len.to_be_bytes())?;
    let mut lib = [0u8; RUNTIME_LIB_LEN];
    lib[..runtime_lib.len()].copy_from_slice(runtime_lib.as_bytes());
    out.write_all(&lib)?;

    out.flush()?;
    Ok(())
}

/// Entry length including its own length field, NUL padding to the index
/// alignment.
fn pad_entry_len(name_len: usize) -> usize {
    // Room for at least one trailing NUL terminator.
    let raw = INDEX_FIXED + name_len + 1;
    raw.div_ceil(INDEX_ALIGN) * INDEX_ALIGN
}

// =============================================================================
// Reader
// =============================================================================

/// Decoded trailing cookie plus where the archive starts inside the file.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub version: u32,
    pub archive_len: u32,
    pub index_offset: u32,
    pub index_len: u32,
    pub runtime_lib: String,
    /// Byte offset of the archive inside the containing file (non-zero when
    /// the archive was appended to an executable).
    pub start: u64,
}

/// One decoded index entry.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub name: String,
    pub offset: u32,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    pub compressed: bool,
    pub type_code: u8,
}

/// Locate and decode the cookie by scanning backward from end of file, the
/// same way the bootstrap binary does.
pub fn read_cookie(path: &Path) -> Result<Cookie> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let file_len = file.metadata()?.len();
    if file_len < COOKIE_LEN as u64 {
        bail!("{} is too short to hold an archive cookie", path.display());
    }
    let window = COOKIE_SCAN_WINDOW.min(file_len);
    file.seek(SeekFrom::End(-(window as i64)))?;
    let mut tail = vec![0u8; window as usize];
    file.read_exact(&mut tail)?;

    let magic_pos = tail
        .windows(COOKIE_MAGIC.len())
        .rposition(|w| w == COOKIE_MAGIC)
        .with_context(|| format!("No archive cookie found in {}", path.display()))?;
    if tail.len() - magic_pos < COOKIE_LEN {
        bail!("Truncated archive cookie in {}", path.display());
    }
    let cookie = &tail[magic_pos..magic_pos + COOKIE_LEN];
    let version = u32::from_be_bytes(cookie[8..12].try_into().expect("4 bytes"));
    if version != FORMAT_VERSION {
        bail!("Unsupported container archive version {version}");
    }
    let archive_len = u32::from_be_bytes(cookie[12..16].try_into().expect("4 bytes"));
    let index_offset = u32::from_be_bytes(cookie[16..20].try_into().expect("4 bytes"));
    let index_len = u32::from_be_bytes(cookie[20..24].try_into().expect("4 bytes"));
    let lib = &cookie[24..];
    let lib_end = lib.iter().position(|&b| b == 0).unwrap_or(lib.len());
    let runtime_lib = String::from_utf8(lib[..lib_end].to_vec())
        .context("Runtime library name is not UTF-8")?;

    let cookie_end = file_len - window + magic_pos as u64 + COOKIE_LEN as u64;
    let start = cookie_end
        .checked_sub(archive_len as u64)
        .context("Archive cookie claims a length larger than the file")?;

    Ok(Cookie {
        version,
        archive_len,
        index_offset,
        index_len,
        runtime_lib,
        start,
    })
}

/// Read the cookie and the full index of a container archive (standalone or
/// appended to an executable).
pub fn read_index(path: &Path) -> Result<(Cookie, Vec<IndexEntry>)> {
    let cookie = read_cookie(path)?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(cookie.start + cookie.index_offset as u64))?;
    let mut index = vec![0u8; cookie.index_len as usize];
    file.read_exact(&mut index)
        .context("Truncated container archive index")?;

    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor < index.len() {
        if index.len() - cursor < INDEX_FIXED {
            bail!("Truncated container archive index entry");
        }
        let entry_len =
            u32::from_be_bytes(index[cursor..cursor + 4].try_into().expect("4 bytes")) as usize;
        if entry_len < INDEX_FIXED || index.len() - cursor < entry_len {
            bail!("Corrupt container archive index entry");
        }
        let fixed = &index[cursor + 4..cursor + INDEX_FIXED];
        let offset = u32::from_be_bytes(fixed[0..4].try_into().expect("4 bytes"));
        let compressed_len = u32::from_be_bytes(fixed[4..8].try_into().expect("4 bytes"));
        let uncompressed_len = u32::from_be_bytes(fixed[8..12].try_into().expect("4 bytes"));
        let compressed = fixed[12] != 0;
        let type_code = fixed[13];
        let name_field = &index[cursor + INDEX_FIXED..cursor + entry_len];
        let name_end = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_field.len());
        let name = String::from_utf8(name_field[..name_end].to_vec())
            .context("Entry name is not UTF-8")?;
        entries.push(IndexEntry {
            name,
            offset,
            compressed_len,
            uncompressed_len,
            compressed,
            type_code,
        });
        cursor += entry_len;
    }
    Ok((cookie, entries))
}

/// Extract one entry's payload, decompressed.
pub fn read_entry_data(path: &Path, cookie: &Cookie, entry: &IndexEntry) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(cookie.start + entry.offset as u64))?;
    let mut payload = vec![0u8; entry.compressed_len as usize];
    file.read_exact(&mut payload)?;
    if entry.compressed {
        let mut out = Vec::with_capacity(entry.uncompressed_len as usize);
        ZlibDecoder::new(payload.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(payload)
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
