//! The executable assembler: attaches a container archive to a prebuilt
//! bootstrap binary, producing the final single-file artifact (or the
//! bootstrap plus a sidecar archive).
//!
//! Attachment strategy is picked by platform and configuration: sidecar
//! copy, ELF section embedding via objcopy, or raw append located by the
//! bootstrap's backward EOF scan.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::archive::container::{CompressionMap, ContainerArchive, ContainerOptions};
use crate::config::BuildConfig;
use crate::fsutil::{self, ScratchFile};
use crate::macho;
use crate::platform::Platform;
use crate::process::Cmd;
use crate::resources::{self, ResourceEditor, ResourceSpec};
use crate::target::{self, Outcome, SavedRecord, Target};
use crate::toc::{flatten_inputs, BuiltArtifact, Entry, EntryKind, NodeInput, Toc};

/// ELF section the archive is embedded under.
pub const ARCHIVE_SECTION: &str = "fpdata";

/// Every recognized executable option, with explicit defaults.
#[derive(Debug, Clone)]
pub struct ExeOptions {
    /// Console or windowed bootstrap. Only meaningful on platforms with a
    /// GUI subsystem distinction; elsewhere the console variant is used.
    pub console: bool,
    /// Use the debug bootstrap variant, which reports its progress.
    pub debug: bool,
    /// Icon file to install in the executable's resources (Windows).
    pub icon: Option<PathBuf>,
    /// Compiled version-info resource to install (Windows).
    pub version_resource: Option<PathBuf>,
    /// Additional resource files to merge (Windows).
    pub resources: Vec<ResourceSpec>,
    /// Request elevation at launch (Windows).
    pub uac_admin: bool,
    /// Allow an elevated process to drive the UI (Windows).
    pub uac_uiaccess: bool,
    /// Strip debug symbols from shared binaries.
    pub strip: bool,
    /// Run shared binaries through the size compactor.
    pub compact: bool,
    /// Binaries (by file name) the compactor must not touch.
    pub compact_exclude: Vec<String>,
    /// Unpack at run time into this directory instead of the platform
    /// default.
    pub runtime_tmpdir: Option<String>,
    /// Have the bootstrap ignore ignorable signals instead of forwarding
    /// them to the child.
    pub ignore_signals: bool,
    /// Append the archive to the binary; false ships it as a sidecar file.
    pub append_archive: bool,
    /// Leave shared binaries out of the archive; a directory assembler
    /// ships them instead.
    pub exclude_binaries: bool,
    /// Per-kind compression overrides for the inner container archive.
    pub compression: Option<CompressionMap>,
}

impl Default for ExeOptions {
    fn default() -> Self {
        Self {
            console: true,
            debug: false,
            icon: None,
            version_resource: None,
            resources: Vec::new(),
            uac_admin: false,
            uac_uiaccess: false,
            strip: false,
            compact: false,
            compact_exclude: Vec::new(),
            runtime_tmpdir: None,
            ignore_signals: false,
            append_archive: true,
            exclude_binaries: false,
            compression: None,
        }
    }
}

/// Build node producing the final executable.
pub struct Executable {
    config: BuildConfig,
    options: ExeOptions,
    /// Final artifact path: dist directory for single-file builds, work
    /// directory when a directory assembler takes over.
    name: PathBuf,
    sidecar_name: String,
    manifest_name: Option<String>,
    manifest_path: Option<PathBuf>,
    toc: Toc,
    archive: ContainerArchive,
    bootstrap: PathBuf,
}

#[derive(Serialize, Deserialize, PartialEq)]
pub struct ExeFields {
    name: PathBuf,
    console: bool,
    debug: bool,
    exclude_binaries: bool,
    icon: Option<PathBuf>,
    version_resource: Option<PathBuf>,
    resources: Vec<ResourceSpec>,
    uac_admin: bool,
    uac_uiaccess: bool,
    append_archive: bool,
    sidecar_name: String,
    strip: bool,
    compact: bool,
    compact_exclude: Vec<String>,
    toc: Toc,
}

impl Executable {
    /// Flatten the inputs into one manifest and set up the inner container
    /// archive. `name` is the bare executable name; placement and platform
    /// suffix are derived here.
    pub fn new(
        config: &BuildConfig,
        name: &str,
        inputs: Vec<NodeInput>,
        options: ExeOptions,
    ) -> Result<Self> {
        let mut options = options;
        let mut toc = flatten_inputs(inputs);

        if let Some(dir) = &options.runtime_tmpdir {
            toc.push(Entry::directive(format!("fp-runtime-tmpdir {dir}")));
        }
        if options.ignore_signals {
            toc.push(Entry::directive("fp-ignore-signals"));
        }

        if config.platform != Platform::Windows {
            if options.version_resource.is_some() || !options.resources.is_empty() {
                eprintln!(
                    "  [WARN] Ignoring version resource and resource files, platform not capable"
                );
            }
            if options.icon.is_some() {
                eprintln!("  [WARN] Ignoring icon, platform not capable");
            }
        }
        options.icon = options.icon.map(|p| config.resolve_spec_path(&p));
        options.version_resource = options
            .version_resource
            .map(|p| config.resolve_spec_path(&p));
        for spec in &mut options.resources {
            spec.file = config.resolve_spec_path(&spec.file);
        }

        let base = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let mut file_name = base;
        if config.platform == Platform::Windows && !file_name.ends_with(".exe") {
            file_name.push_str(".exe");
        }
        let stem = Path::new(&file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        // Directory-mode executables land in the work directory; the
        // directory assembler collects them into dist. Single-file builds
        // go straight to dist.
        let output_dir = if options.exclude_binaries {
            &config.workpath
        } else {
            &config.distpath
        };
        let output = output_dir.join(&file_name);
        let sidecar_name = format!("{stem}.fpk");

        let mut manifest_name = None;
        let mut manifest_path = None;
        if config.platform == Platform::Windows {
            let m_name = format!("{file_name}.manifest");
            let m_path = config.workpath.join(&m_name);
            resources::write_manifest(&m_path, &stem, options.uac_admin, options.uac_uiaccess)?;
            toc.push(Entry::new(&m_name, &m_path, EntryKind::Binary));
            if !options.exclude_binaries {
                // Single-file mode loads the manifest explicitly, so the
                // executable stays renamable.
                toc.push(Entry::directive(format!(
                    "fp-windows-manifest-filename {m_name}"
                )));
            }
            manifest_name = Some(m_name);
            manifest_path = Some(m_path);
        }

        let archive = ContainerArchive::new(
            config,
            toc.clone(),
            ContainerOptions {
                name: Some(config.workpath.join(format!("{stem}.fpk"))),
                compression: options.compression.clone(),
                exclude_binaries: options.exclude_binaries,
                strip: options.strip,
                compact: options.compact,
                compact_exclude: options.compact_exclude.clone(),
            },
        );
        let bootstrap = bootstrap_file(config, options.console, options.debug);

        Ok(Self {
            config: config.clone(),
            options,
            name: output,
            sidecar_name,
            manifest_name,
            manifest_path,
            toc,
            archive,
            bootstrap,
        })
    }

    /// Build the inner container archive, then the executable itself.
    pub fn build(&mut self) -> Result<Outcome> {
        target::build(&mut self.archive)?;
        target::build(self)
    }

    /// The sidecar archive's path next to the executable.
    pub fn sidecar_path(&self) -> PathBuf {
        self.name.with_file_name(&self.sidecar_name)
    }

    /// This node's output as input for a directory assembler, including the
    /// files that must travel with it.
    pub fn artifact(&self) -> BuiltArtifact {
        let mut dependencies = Toc::new();
        if !self.options.append_archive {
            dependencies.push(Entry::new(
                &self.sidecar_name,
                self.sidecar_path(),
                EntryKind::Container,
            ));
        }
        if let (Some(name), Some(path)) = (&self.manifest_name, &self.manifest_path) {
            dependencies.push(Entry::new(name, path, EntryKind::Binary));
        }
        BuiltArtifact {
            name: self
                .name
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: self.name.clone(),
            kind: EntryKind::Executable,
            dependencies,
        }
    }

    fn apply_resources(&self, exe: &Path) {
        let editor = ResourceEditor::probe();
        if let Some(icon) = &self.options.icon {
            if let Err(e) = editor.set_icon(exe, icon) {
                eprintln!("  [WARN] Failed to set icon from {}: {:#}", icon.display(), e);
            }
        }
        if let Some(version) = &self.options.version_resource {
            if let Err(e) = editor.set_version_info(exe, version) {
                eprintln!(
                    "  [WARN] Failed to set version info from {}: {:#}",
                    version.display(),
                    e
                );
            }
        }
        for spec in &self.options.resources {
            if let Err(e) = editor.merge_resources(exe, spec) {
                eprintln!(
                    "  [WARN] Failed to merge resources from {}: {:#}",
                    spec.file.display(),
                    e
                );
            }
        }
        if !self.options.exclude_binaries {
            if let Some(manifest) = &self.manifest_path {
                if let Err(e) = editor.set_manifest(exe, manifest) {
                    eprintln!("  [WARN] Failed to embed manifest: {:#}", e);
                }
            }
        }
    }
}

impl Target for Executable {
    type Fields = ExeFields;

    fn kind_name(&self) -> &'static str {
        "EXE"
    }

    fn output_path(&self) -> &Path {
        &self.name
    }

    fn record_path(&self) -> PathBuf {
        target::record_path_for(&self.config.workpath, self.kind_name(), &self.name)
    }

    fn tracked_fields(&self) -> ExeFields {
        ExeFields {
            name: self.name.clone(),
            console: self.options.console,
            debug: self.options.debug,
            exclude_binaries: self.options.exclude_binaries,
            icon: self.options.icon.clone(),
            version_resource: self.options.version_resource.clone(),
            resources: self.options.resources.clone(),
            uac_admin: self.options.uac_admin,
            uac_uiaccess: self.options.uac_uiaccess,
            append_archive: self.options.append_archive,
            sidecar_name: self.sidecar_name.clone(),
            strip: self.options.strip,
            compact: self.options.compact,
            compact_exclude: self.options.compact_exclude.clone(),
            toc: self.toc.clone(),
        }
    }

    fn input_files(&self) -> Vec<PathBuf> {
        vec![self.bootstrap.clone()]
    }

    fn extra_staleness(&self, record: &SavedRecord<ExeFields>) -> Option<String> {
        if !self.options.append_archive && !self.sidecar_path().exists() {
            return Some(format!("sidecar archive {} missing", self.sidecar_name));
        }
        if fsutil::mtime(&self.name) != Some(record.output_mtime) {
            return Some("output was modified since the last build".to_string());
        }
        if let Some(archive_mtime) = fsutil::mtime(self.archive.output_path()) {
            if archive_mtime > record.built_at {
                return Some("container archive is newer than the last build".to_string());
            }
        }
        None
    }

    fn assemble(&mut self) -> Result<()> {
        if self.name.exists() {
            fs::remove_file(&self.name)?;
        }
        if let Some(parent) = self.name.parent() {
            fs::create_dir_all(parent)?;
        }
        if !self.bootstrap.is_file() {
            bail!(
                "Fatal error: no prebuilt bootstrap binary at {}. A bootloader \
                 for this platform and variant must be installed before packaging.",
                self.bootstrap.display()
            );
        }
        let archive_path = self.archive.output_path().to_path_buf();

        // Resource edits run on a scratch copy so the installed bootstrap
        // binaries are never patched in place.
        let wants_resources = self.options.icon.is_some()
            || self.options.version_resource.is_some()
            || !self.options.resources.is_empty();
        let (exe_src, _scratch): (PathBuf, Option<ScratchFile>) =
            if self.config.platform == Platform::Windows && wants_resources {
                let bootstrap_name = self
                    .bootstrap
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "run".to_string());
                let scratch = ScratchFile::create(&self.config.workpath, &bootstrap_name)?;
                fsutil::copy_file(&self.bootstrap, scratch.path())?;
                fsutil::mark_executable(scratch.path())?;
                self.apply_resources(scratch.path());
                (scratch.path().to_path_buf(), Some(scratch))
            } else {
                (self.bootstrap.clone(), None)
            };

        if !self.options.append_archive {
            println!("  Copying bootstrap binary to {}", self.name.display());
            fsutil::copy_file(&exe_src, &self.name)?;
            let sidecar = self.sidecar_path();
            if sidecar != archive_path {
                println!("  Copying archive to {}", sidecar.display());
                fsutil::copy_file(&archive_path, &sidecar)?;
            }
        } else if self.config.platform == Platform::Linux {
            fsutil::copy_file(&exe_src, &self.name)?;
            println!(
                "  Embedding archive as section '{}' in {}",
                ARCHIVE_SECTION,
                self.name.display()
            );
            Cmd::new("objcopy")
                .arg("--add-section")
                .arg(format!("{}={}", ARCHIVE_SECTION, archive_path.display()))
                .arg_path(&self.name)
                .error_msg("objcopy failed to embed the archive")
                .run()?;
        } else {
            println!("  Appending archive to {}", self.name.display());
            let mut out = File::create(&self.name)
                .with_context(|| format!("Failed to create {}", self.name.display()))?;
            io::copy(&mut File::open(&exe_src)?, &mut out)?;
            io::copy(&mut File::open(&archive_path)?, &mut out)?;
        }

        if self.config.platform == Platform::MacOs && self.options.append_archive {
            macho::fix_for_signing(&self.name)?;
        }
        fsutil::mark_executable(&self.name)?;
        Ok(())
    }
}

/// Pick the prebuilt bootstrap variant: `run`, `runw`, `run_d` or `runw_d`
/// under the platform's bootloader subdirectory. Windowed variants exist
/// only where the platform distinguishes subsystems.
fn bootstrap_file(config: &BuildConfig, console: bool, debug: bool) -> PathBuf {
    let mut stem = String::from("run");
    if config.platform.has_windowed_variant() && !console {
        stem.push('w');
    }
    if debug {
        stem.push_str("_d");
    }
    config
        .bootloader_dir
        .join(config.platform.dir_name())
        .join(format!("{stem}{}", config.platform.exe_suffix()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(platform: Platform) -> BuildConfig {
        BuildConfig {
            workpath: "/tmp/work".into(),
            distpath: "/tmp/dist".into(),
            specpath: "/tmp".into(),
            bootloader_dir: "/opt/bootloader".into(),
            cache_dir: "/tmp/cache".into(),
            platform,
            runtime_lib: "librt.so.1".into(),
            has_compactor: false,
        }
    }

    #[test]
    fn test_bootstrap_variants() {
        let linux = test_config(Platform::Linux);
        assert_eq!(
            bootstrap_file(&linux, true, false),
            PathBuf::from("/opt/bootloader/linux/run")
        );
        // No windowed variant on Linux even when console is off.
        assert_eq!(
            bootstrap_file(&linux, false, true),
            PathBuf::from("/opt/bootloader/linux/run_d")
        );

        let windows = test_config(Platform::Windows);
        assert_eq!(
            bootstrap_file(&windows, false, false),
            PathBuf::from("/opt/bootloader/windows/runw.exe")
        );
        assert_eq!(
            bootstrap_file(&windows, true, true),
            PathBuf::from("/opt/bootloader/windows/run_d.exe")
        );

        let macos = test_config(Platform::MacOs);
        assert_eq!(
            bootstrap_file(&macos, false, true),
            PathBuf::from("/opt/bootloader/darwin/runw_d")
        );
    }
}
