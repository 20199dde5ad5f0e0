//! Target platform identification and per-platform file conventions.

use serde::{Deserialize, Serialize};

/// Platform a build targets. Drives shared-library suffixes, bootstrap
/// binary selection, and the archive attachment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// The platform this build is running on.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    /// Subdirectory of the bootloader directory holding this platform's
    /// prebuilt bootstrap binaries.
    pub fn dir_name(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "darwin",
            Platform::Windows => "windows",
        }
    }

    /// Conventional shared-library suffix, with leading dot.
    pub fn shared_lib_suffix(self) -> &'static str {
        match self {
            Platform::Linux => ".so",
            Platform::MacOs => ".dylib",
            Platform::Windows => ".dll",
        }
    }

    /// Executable suffix, empty where the platform has none.
    pub fn exe_suffix(self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            _ => "",
        }
    }

    /// Whether the platform distinguishes windowed from console executables.
    /// Only those platforms ship a separate windowed bootstrap variant.
    pub fn has_windowed_variant(self) -> bool {
        matches!(self, Platform::Windows | Platform::MacOs)
    }
}
