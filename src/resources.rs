//! Windows executable resource editing and side-by-side manifest generation.
//!
//! Resource edits go through an external resource editor probed on PATH.
//! Every edit targets a scratch copy of the bootstrap binary before the
//! archive is attached; a missing editor or a failed edit skips that one
//! edit and never aborts the build.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fsutil;
use crate::process::Cmd;

/// One resource merge request: a resource file plus an optional
/// (type, name, language) mask. Unset fields and `*` act as wildcards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub file: PathBuf,
    pub res_type: Option<String>,
    pub res_name: Option<String>,
    pub res_lang: Option<String>,
}

impl ResourceSpec {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            res_type: None,
            res_name: None,
            res_lang: None,
        }
    }

    /// Parse the `file[,type[,name[,language]]]` form used in build
    /// descriptions.
    pub fn parse(spec: &str) -> Self {
        let mut parts = spec.split(',').map(str::trim);
        let file = parts.next().unwrap_or_default();
        let field = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            file: PathBuf::from(file),
            res_type: field(parts.next()),
            res_name: field(parts.next()),
            res_lang: field(parts.next()),
        }
    }

    /// True when both type and name are given explicitly, with no wildcard.
    /// Only then may the file be inserted as one raw resource payload.
    fn explicit(&self) -> bool {
        matches!((&self.res_type, &self.res_name), (Some(t), Some(n)) if t != "*" && n != "*")
    }

    fn mask(&self) -> String {
        // The editor treats an empty mask field as "all".
        let part = |f: &Option<String>| match f {
            Some(v) if v != "*" => v.clone(),
            _ => String::new(),
        };
        format!(
            "{},{},{}",
            part(&self.res_type),
            part(&self.res_name),
            part(&self.res_lang)
        )
    }
}

/// Wrapper around the external resource editor.
pub struct ResourceEditor {
    tool: Option<PathBuf>,
}

impl ResourceEditor {
    /// Probe PATH for the editor. On non-Windows hosts it is typically a
    /// wine-wrapped binary under the same name.
    pub fn probe() -> Self {
        let tool = ["resourcehacker", "ResourceHacker"]
            .iter()
            .find_map(|name| which::which(name).ok());
        Self { tool }
    }

    pub fn available(&self) -> bool {
        self.tool.is_some()
    }

    fn tool(&self) -> Result<&Path> {
        self.tool
            .as_deref()
            .context("No resource editor found on PATH")
    }

    fn run(&self, exe: &Path, action: &str, res: &Path, mask: &str) -> Result<()> {
        let tool = self.tool()?;
        Cmd::new(tool.to_string_lossy())
            .arg("-open")
            .arg_path(exe)
            .arg("-save")
            .arg_path(exe)
            .arg("-action")
            .arg(action)
            .arg("-res")
            .arg_path(res)
            .arg("-mask")
            .arg(mask)
            .error_msg("Resource edit failed")
            .run()?;
        Ok(())
    }

    /// Replace the executable's icon resources.
    pub fn set_icon(&self, exe: &Path, icon: &Path) -> Result<()> {
        if !icon.is_file() {
            bail!("Icon file {} not found", icon.display());
        }
        self.run(exe, "addoverwrite", icon, "ICONGROUP,MAINICON,")
    }

    /// Write a version-info block from a compiled version resource file.
    pub fn set_version_info(&self, exe: &Path, version: &Path) -> Result<()> {
        if !version.is_file() {
            bail!("Version resource {} not found", version.display());
        }
        self.run(exe, "addoverwrite", version, "VERSIONINFO,1,")
    }

    /// Embed the side-by-side manifest as the executable's manifest
    /// resource.
    pub fn set_manifest(&self, exe: &Path, manifest: &Path) -> Result<()> {
        self.run(exe, "addoverwrite", manifest, "MANIFEST,1,")
    }

    /// Merge a resource file into the executable, wildcard-matched by
    /// (type, name, language). When the source file itself carries no
    /// resource table and the mask is fully explicit, fall back to
    /// inserting it as one raw resource payload.
    pub fn merge_resources(&self, exe: &Path, spec: &ResourceSpec) -> Result<()> {
        if !spec.file.is_file() {
            bail!("Resource file {} not found", spec.file.display());
        }
        match self.run(exe, "addoverwrite", &spec.file, &spec.mask()) {
            Ok(()) => Ok(()),
            Err(merge_err) => {
                if !spec.explicit() {
                    return Err(merge_err).context(
                        "Resource merge failed and no explicit type/name was given \
                         for a raw-data fallback",
                    );
                }
                self.run(exe, "add", &spec.file, &spec.mask())
                    .context("Failed to insert resource file as raw payload")
            }
        }
    }
}

/// Write a side-by-side application manifest requesting the configured
/// execution level.
pub fn write_manifest(
    path: &Path,
    app_name: &str,
    uac_admin: bool,
    uac_uiaccess: bool,
) -> Result<()> {
    let level = if uac_admin {
        "requireAdministrator"
    } else {
        "asInvoker"
    };
    let ui_access = if uac_uiaccess { "true" } else { "false" };
    let manifest = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <assemblyIdentity type="win32" name="{app_name}" processorArchitecture="*" version="1.0.0.0"/>
  <trustInfo xmlns="urn:schemas-microsoft-com:asm.v3">
    <security>
      <requestedPrivileges>
        <requestedExecutionLevel level="{level}" uiAccess="{ui_access}"/>
      </requestedPrivileges>
    </security>
  </trustInfo>
</assembly>
"#
    );
    fsutil::write_file_with_dirs(path, manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_parse() {
        let spec = ResourceSpec::parse("extra.res,24,1,1033");
        assert_eq!(spec.file, PathBuf::from("extra.res"));
        assert_eq!(spec.res_type.as_deref(), Some("24"));
        assert_eq!(spec.res_name.as_deref(), Some("1"));
        assert_eq!(spec.res_lang.as_deref(), Some("1033"));

        let bare = ResourceSpec::parse("extra.res");
        assert_eq!(bare.res_type, None);
        assert_eq!(bare.mask(), ",,");
    }

    #[test]
    fn test_explicit_rejects_wildcards() {
        let mut spec = ResourceSpec::parse("extra.res,24,1");
        assert!(spec.explicit());
        spec.res_name = Some("*".into());
        assert!(!spec.explicit());
        spec.res_name = None;
        assert!(!spec.explicit());
    }

    #[test]
    fn test_manifest_levels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.exe.manifest");

        write_manifest(&path, "app", true, false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("requireAdministrator"));
        assert!(content.contains(r#"uiAccess="false""#));

        write_manifest(&path, "app", false, true).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("asInvoker"));
        assert!(content.contains(r#"uiAccess="true""#));
    }
}
