//! Manifest model - the ordered (name, source path, kind) entry collections
//! that every pipeline stage consumes and produces.
//!
//! A `Toc` keeps insertion order and silently drops exact duplicates. Two
//! entries may still share an internal name with different source paths;
//! resolving that is the container archive's keep-first-and-warn rule.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Classification of a manifest entry.
///
/// The one-character codes are what the bootstrap binary's archive reader
/// understands; `Extension`, `Binary` and `Executable` all read back as
/// generic binaries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EntryKind {
    /// Compiled interpreted-code module.
    Module,
    /// Interpreted-code source file, run at startup in manifest order.
    Source,
    /// Compiled extension shared library.
    Extension,
    /// Shared library or other native binary.
    Binary,
    /// Arbitrary data file.
    Data,
    /// A nested module archive.
    Archive,
    /// A nested container archive.
    Container,
    /// A zip file kept intact.
    Zip,
    /// A built executable.
    Executable,
    /// Reference to a file packaged by another executable of the same build.
    Dependency,
    /// Carries a directive for the bootstrap binary, no payload.
    Option,
}

impl EntryKind {
    /// One-character type code used in the container archive index.
    pub fn type_code(self) -> u8 {
        match self {
            EntryKind::Module => b'm',
            EntryKind::Source => b's',
            EntryKind::Extension => b'b',
            EntryKind::Binary => b'b',
            EntryKind::Data => b'x',
            EntryKind::Archive => b'z',
            EntryKind::Container => b'a',
            EntryKind::Zip => b'Z',
            EntryKind::Executable => b'b',
            EntryKind::Dependency => b'd',
            EntryKind::Option => b'o',
        }
    }

    /// True for entries that are native shared objects.
    pub fn is_binary(self) -> bool {
        matches!(self, EntryKind::Binary | EntryKind::Extension)
    }
}

/// One manifest entry: internal name, backing file, classification.
///
/// `Option` entries carry a directive string in `name` and an empty `path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
}

impl Entry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
        }
    }

    /// A payload-less directive entry for the bootstrap binary.
    pub fn directive(text: impl Into<String>) -> Self {
        Self {
            name: text.into(),
            path: PathBuf::new(),
            kind: EntryKind::Option,
        }
    }
}

/// Ordered manifest with exact-duplicate suppression.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Entry>", into = "Vec<Entry>")]
pub struct Toc {
    entries: Vec<Entry>,
    seen: HashSet<Entry>,
}

impl Toc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<Entry>) -> Self {
        let mut toc = Self::new();
        for entry in entries {
            toc.push(entry);
        }
        toc
    }

    /// Append an entry unless an identical one is already present.
    ///
    /// Returns false when the entry was dropped as a duplicate.
    pub fn push(&mut self, entry: Entry) -> bool {
        if self.seen.contains(&entry) {
            return false;
        }
        self.seen.insert(entry.clone());
        self.entries.push(entry);
        true
    }

    /// Append every entry of `other`, keeping this manifest's order first.
    pub fn extend(&mut self, other: &Toc) {
        for entry in other.iter() {
            self.push(entry.clone());
        }
    }

    /// A copy of this manifest without any entry whose name appears in
    /// `other`. Used to carve the bootstrap modules out of a module archive.
    pub fn subtract(&self, other: &Toc) -> Toc {
        let names: HashSet<&str> = other.iter().map(|e| e.name.as_str()).collect();
        let mut result = Toc::new();
        for entry in self.iter() {
            if !names.contains(entry.name.as_str()) {
                result.push(entry.clone());
            }
        }
        result
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Toc {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Toc {}

impl From<Vec<Entry>> for Toc {
    fn from(entries: Vec<Entry>) -> Self {
        Toc::from_entries(entries)
    }
}

impl From<Toc> for Vec<Entry> {
    fn from(toc: Toc) -> Self {
        toc.entries
    }
}

impl<'a> IntoIterator for &'a Toc {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The analysis result for one executable, as handed over by the external
/// dependency analysis: startup scripts, native binaries, data files, and the
/// cross-executable dependency references accumulated by deduplication.
#[derive(Debug, Clone, Default)]
pub struct AnalysisTocs {
    pub scripts: Toc,
    pub binaries: Toc,
    pub datas: Toc,
    pub dependencies: Toc,
}

/// Output of an already-built node, consumable as assembler input.
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    /// Internal name the artifact gets inside a downstream manifest.
    pub name: String,
    /// The artifact file on disk.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Extra files a downstream node must also ship.
    pub dependencies: Toc,
}

/// Assembler input: either raw manifest entries or a built node's output.
#[derive(Debug, Clone)]
pub enum NodeInput {
    Entries(Toc),
    Built(BuiltArtifact),
}

/// Append the platform's shared-library suffix to extension entries that
/// lack it, so their internal names match what the runtime's loader asks
/// for. Other kinds keep their names; generic binaries legitimately carry
/// non-library names.
pub fn normalize_extension_names(toc: &Toc, suffix: &str) -> Toc {
    let mut out = Toc::new();
    for entry in toc {
        let mut entry = entry.clone();
        if entry.kind == EntryKind::Extension && !entry.name.ends_with(suffix) {
            entry.name.push_str(suffix);
        }
        out.push(entry);
    }
    out
}

/// Flatten assembler inputs into one manifest. Built artifacts contribute
/// their own entry followed by their dependency set.
pub fn flatten_inputs(inputs: Vec<NodeInput>) -> Toc {
    let mut toc = Toc::new();
    for input in inputs {
        match input {
            NodeInput::Entries(entries) => toc.extend(&entries),
            NodeInput::Built(artifact) => {
                toc.push(Entry::new(&artifact.name, &artifact.path, artifact.kind));
                toc.extend(&artifact.dependencies);
            }
        }
    }
    toc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_drops_exact_duplicates() {
        let mut toc = Toc::new();
        assert!(toc.push(Entry::new("a", "/src/a", EntryKind::Data)));
        assert!(!toc.push(Entry::new("a", "/src/a", EntryKind::Data)));
        assert_eq!(toc.len(), 1);
    }

    #[test]
    fn test_push_keeps_same_name_different_path() {
        let mut toc = Toc::new();
        toc.push(Entry::new("a.so", "/src/a.so", EntryKind::Binary));
        toc.push(Entry::new("a.so", "/other/a.so", EntryKind::Binary));
        assert_eq!(toc.len(), 2);
    }

    #[test]
    fn test_order_is_preserved() {
        let mut toc = Toc::new();
        toc.push(Entry::new("z", "/z", EntryKind::Data));
        toc.push(Entry::new("a", "/a", EntryKind::Data));
        let names: Vec<&str> = toc.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["z", "a"]);
    }

    #[test]
    fn test_subtract_removes_by_name() {
        let mut toc = Toc::new();
        toc.push(Entry::new("keep", "/keep", EntryKind::Module));
        toc.push(Entry::new("boot", "/boot", EntryKind::Module));

        let mut boot = Toc::new();
        // Different path, same name: subtraction is by name only.
        boot.push(Entry::new("boot", "/elsewhere", EntryKind::Module));

        let rest = toc.subtract(&boot);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest.entries()[0].name, "keep");
    }

    #[test]
    fn test_serde_round_trip() {
        let mut toc = Toc::new();
        toc.push(Entry::new("mod_a", "/src/mod_a.src", EntryKind::Module));
        toc.push(Entry::directive("fp-ignore-signals"));

        let json = serde_json::to_string(&toc).unwrap();
        let back: Toc = serde_json::from_str(&json).unwrap();
        assert_eq!(toc, back);
    }

    #[test]
    fn test_normalize_extension_names() {
        let mut toc = Toc::new();
        toc.push(Entry::new("ext_mod", "/src/ext_mod.so", EntryKind::Extension));
        toc.push(Entry::new("data.txt", "/src/data.txt", EntryKind::Data));
        let out = normalize_extension_names(&toc, ".so");
        let names: Vec<&str> = out.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["ext_mod.so", "data.txt"]);
    }

    #[test]
    fn test_flatten_inputs_folds_dependencies() {
        let mut deps = Toc::new();
        deps.push(Entry::new("boot_mod", "/work/boot_mod.fpc", EntryKind::Module));
        let artifact = BuiltArtifact {
            name: "modules.fpz".into(),
            path: "/work/modules.fpz".into(),
            kind: EntryKind::Archive,
            dependencies: deps,
        };
        let mut raw = Toc::new();
        raw.push(Entry::new("main", "/src/main.src", EntryKind::Source));

        let toc = flatten_inputs(vec![NodeInput::Entries(raw), NodeInput::Built(artifact)]);
        let names: Vec<&str> = toc.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["main", "modules.fpz", "boot_mod"]);
    }
}
