//! The two binary container formats: the module archive (`.fpz`) holding
//! compiled interpreted-code modules, and the heterogeneous container
//! archive (`.fpk`) the bootstrap binary unpacks at process start.

pub mod cipher;
pub mod container;
pub mod module_archive;

pub use cipher::ArchiveCipher;
pub use container::{CompressionMap, ContainerArchive, ContainerOptions};
pub use module_archive::{ModuleArchive, ModuleArchiveOptions};
