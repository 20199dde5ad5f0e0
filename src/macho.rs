//! Mach-O header fix-up after appending the archive.
//!
//! Appended bytes fall outside the file ranges the load commands describe,
//! and signing tools reject the result. Extending the __LINKEDIT segment and
//! the symbol string range to the new end of file keeps the binary signable.

use anyhow::{bail, Result};
use std::fs;
use std::path::Path;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const HEADER_LEN: usize = 32;
const LC_SYMTAB: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;
const LINKEDIT: &[u8] = b"__LINKEDIT\0\0\0\0\0\0";

/// Extend the load-command file ranges of a 64-bit Mach-O executable to
/// cover data appended after the link-time end of file.
///
/// Non-Mach-O input is skipped with a warning; the attachment itself is
/// already done and still runs, it just cannot be signed.
pub fn fix_for_signing(path: &Path) -> Result<()> {
    let mut data = fs::read(path)?;
    if data.len() < HEADER_LEN || read_u32(&data, 0) != MH_MAGIC_64 {
        eprintln!(
            "  [WARN] {} is not a 64-bit Mach-O image, skipping header fix-up",
            path.display()
        );
        return Ok(());
    }
    let file_len = data.len() as u64;
    let ncmds = read_u32(&data, 16);

    let mut off = HEADER_LEN;
    for _ in 0..ncmds {
        if data.len() < off + 8 {
            bail!("Truncated Mach-O load command in {}", path.display());
        }
        let cmd = read_u32(&data, off);
        let cmdsize = read_u32(&data, off + 4) as usize;
        if cmdsize < 8 || data.len() < off + cmdsize {
            bail!("Corrupt Mach-O load command in {}", path.display());
        }
        match cmd {
            LC_SEGMENT_64 if cmdsize >= 72 && &data[off + 8..off + 24] == LINKEDIT => {
                let fileoff = read_u64(&data, off + 40);
                let new_size = file_len.saturating_sub(fileoff);
                write_u64(&mut data, off + 32, new_size); // vmsize
                write_u64(&mut data, off + 48, new_size); // filesize
            }
            LC_SYMTAB if cmdsize >= 24 => {
                let stroff = read_u32(&data, off + 16) as u64;
                let new_strsize = file_len.saturating_sub(stroff);
                write_u32(&mut data, off + 20, new_strsize as u32);
            }
            _ => {}
        }
        off += cmdsize;
    }

    fs::write(path, data)?;
    Ok(())
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().expect("4 bytes"))
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().expect("8 bytes"))
}

fn write_u32(data: &mut [u8], off: usize, value: u32) {
    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(data: &mut [u8], off: usize, value: u64) {
    data[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal 64-bit Mach-O image: header, one __LINKEDIT segment command,
    /// one symtab command.
    fn synthetic_macho() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // cputype
        data.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
        data.extend_from_slice(&2u32.to_le_bytes()); // filetype MH_EXECUTE
        data.extend_from_slice(&2u32.to_le_bytes()); // ncmds
        data.extend_from_slice(&(72u32 + 24).to_le_bytes()); // sizeofcmds
        data.extend_from_slice(&0u32.to_le_bytes()); // flags
        data.extend_from_slice(&0u32.to_le_bytes()); // reserved

        // LC_SEGMENT_64 __LINKEDIT
        data.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        data.extend_from_slice(&72u32.to_le_bytes());
        data.extend_from_slice(LINKEDIT);
        data.extend_from_slice(&0u64.to_le_bytes()); // vmaddr
        data.extend_from_slice(&64u64.to_le_bytes()); // vmsize
        data.extend_from_slice(&128u64.to_le_bytes()); // fileoff
        data.extend_from_slice(&64u64.to_le_bytes()); // filesize
        data.extend_from_slice(&[0u8; 16]); // prot + counts + flags

        // LC_SYMTAB
        data.extend_from_slice(&LC_SYMTAB.to_le_bytes());
        data.extend_from_slice(&24u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // symoff
        data.extend_from_slice(&0u32.to_le_bytes()); // nsyms
        data.extend_from_slice(&128u32.to_le_bytes()); // stroff
        data.extend_from_slice(&64u32.to_le_bytes()); // strsize

        data.resize(192, 0);
        data
    }

    #[test]
    fn test_extends_ranges_over_appended_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let mut image = synthetic_macho();
        image.extend_from_slice(b"appended archive bytes");
        let total = image.len() as u64;
        fs::write(&path, &image).unwrap();

        fix_for_signing(&path).unwrap();

        let fixed = fs::read(&path).unwrap();
        let seg_off = HEADER_LEN;
        assert_eq!(read_u64(&fixed, seg_off + 48), total - 128); // filesize
        assert_eq!(read_u64(&fixed, seg_off + 32), total - 128); // vmsize
        let sym_off = HEADER_LEN + 72;
        assert_eq!(read_u32(&fixed, sym_off + 20), (total - 128) as u32);
    }

    #[test]
    fn test_non_macho_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        fs::write(&path, b"\x7fELF not a mach-o").unwrap();
        fix_for_signing(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"\x7fELF not a mach-o");
    }
}
