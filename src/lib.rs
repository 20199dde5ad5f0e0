//! frostpack - freezes resolved build manifests into distributable
//! artifacts.
//!
//! The pipeline consumes manifests produced by an external dependency
//! analysis and packages them: pure interpreted-code modules into a module
//! archive (`.fpz`), everything into an indexed container archive (`.fpk`),
//! and the container onto a prebuilt bootstrap binary as one executable
//! (`exe`) or a directory tree (`collect`). When several executables are
//! built together, `merge` rewrites their manifests so shared files are
//! packaged once.
//!
//! Every artifact is a build node (`target::Target`) with a persisted
//! staleness record; assembly is skipped when nothing changed.

pub mod archive;
pub mod cache;
pub mod code;
pub mod collect;
pub mod config;
pub mod exe;
pub mod fsutil;
pub mod macho;
pub mod merge;
pub mod platform;
pub mod process;
pub mod resources;
pub mod target;
pub mod toc;

pub use archive::{ArchiveCipher, CompressionMap, ContainerArchive, ContainerOptions};
pub use archive::{ModuleArchive, ModuleArchiveOptions};
pub use collect::{Collect, CollectOptions};
pub use config::BuildConfig;
pub use exe::{Executable, ExeOptions};
pub use merge::{merge_dependencies, MergeUnit};
pub use platform::Platform;
pub use target::{build, Outcome, Target};
pub use toc::{AnalysisTocs, BuiltArtifact, Entry, EntryKind, NodeInput, Toc};
