//! ELF inspection.
//!
//! Reads the dynamic-section entries and debug-related notes smith cares
//! about: `DT_NEEDED`, `DT_RUNPATH`/`DT_RPATH`, the `.interp` loader
//! path, the GNU build id, and the `.gnu_debuglink` file name.

use std::path::Path;

use goblin::elf::header::{ET_DYN, ET_EXEC, ET_REL};
use goblin::elf::section_header::{SectionHeader, SHT_NOBITS, SHT_NOTE};
use goblin::elf::Elf;
use smith_core::{Result, SmithError};

/// NT_GNU_BUILD_ID as defined in <elf.h>.
const NT_GNU_BUILD_ID: u32 = 3;

/// What smith extracts from a single ELF file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElfInfo {
    /// `DT_NEEDED` sonames, in order.
    pub needed: Vec<String>,
    /// First `DT_RUNPATH` entry, if any.
    pub runpath: Option<String>,
    /// First `DT_RPATH` entry, if any.
    pub rpath: Option<String>,
    /// Loader path from `.interp`, trailing NUL stripped.
    pub interp: Option<String>,
    /// Lowercase hex of the GNU build-id note description.
    pub build_id: Option<String>,
    /// File name from `.gnu_debuglink` (CRC discarded).
    pub debug_link: Option<String>,
}

/// Inspect an ELF file.
///
/// Returns `Ok(None)` for files that aren't ELF at all; that's how the
/// dependency walker skips scripts and data files. Debug-related
/// sections are only examined for EXEC, DYN, and REL files, and a
/// malformed build-id note is an error.
pub fn inspect(path: &Path) -> Result<Option<ElfInfo>> {
    let data = std::fs::read(path)?;
    let elf = match Elf::parse(&data) {
        Ok(elf) => elf,
        Err(_) => {
            tracing::debug!(path = %path.display(), "not an ELF");
            return Ok(None);
        }
    };

    let mut info = ElfInfo {
        needed: elf.libraries.iter().map(|s| s.to_string()).collect(),
        runpath: elf.runpaths.first().map(|s| s.to_string()),
        rpath: elf.rpaths.first().map(|s| s.to_string()),
        interp: elf.interpreter.map(|s| s.to_string()),
        ..Default::default()
    };

    let e_type = elf.header.e_type;
    if e_type == ET_EXEC || e_type == ET_DYN || e_type == ET_REL {
        if let Some(section) = find_section(&elf, ".note.gnu.build-id") {
            if section.sh_type != SHT_NOTE {
                return Err(SmithError::Format(format!(
                    "section .note.gnu.build-id in {} is not a note",
                    path.display()
                )));
            }
            info.build_id = Some(decode_build_id(section_bytes(&data, section)?)?);
        }
        if let Some(section) = find_section(&elf, ".gnu_debuglink") {
            info.debug_link = Some(decode_debug_link(section_bytes(&data, section)?)?);
        }
    }

    Ok(Some(info))
}

/// Locate a section header by name.
fn find_section<'a>(elf: &'a Elf, name: &str) -> Option<&'a SectionHeader> {
    elf.section_headers
        .iter()
        .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(name))
}

/// Borrow a section's bytes out of the file image.
fn section_bytes<'a>(data: &'a [u8], section: &SectionHeader) -> Result<&'a [u8]> {
    if section.sh_type == SHT_NOBITS {
        return Err(SmithError::Format("section has no data".to_string()));
    }
    let start = section.sh_offset as usize;
    start
        .checked_add(section.sh_size as usize)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| SmithError::Format("section data out of bounds".to_string()))
}

/// Round an offset up to the next 4-byte boundary.
fn align4(offset: u32) -> u32 {
    if offset % 4 != 0 {
        (offset + 4) - (offset % 4)
    } else {
        offset
    }
}

fn read_u32le(data: &[u8], offset: usize) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SmithError::Format("truncated ELF note".to_string()))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Decode a `.note.gnu.build-id` payload.
///
/// ELF notes start with a 3-word header: name size, description size,
/// note type. The name ("GNU", NUL-terminated) and description (the
/// binary hash) follow, each padded to a 4-byte boundary.
pub(crate) fn decode_build_id(data: &[u8]) -> Result<String> {
    const HDR_LEN: u32 = 12;
    if data.len() as u32 <= HDR_LEN {
        return Err(SmithError::Format(
            "build-id note has no data".to_string(),
        ));
    }
    let name_size = read_u32le(data, 0)?;
    let desc_size = read_u32le(data, 4)?;
    let note_type = read_u32le(data, 8)?;

    let offset = align4(HDR_LEN);
    if name_size == 0 {
        return Err(SmithError::Format("build-id note has no name".to_string()));
    }
    let name_end = offset
        .checked_add(name_size - 1)
        .ok_or_else(|| SmithError::Format("truncated build-id note".to_string()))?;
    let name = data
        .get(offset as usize..name_end as usize)
        .ok_or_else(|| SmithError::Format("truncated build-id note".to_string()))?;
    if name != b"GNU" || note_type != NT_GNU_BUILD_ID {
        return Err(SmithError::Format(format!(
            "malformed build-id note: name {:?} type {}",
            String::from_utf8_lossy(name),
            note_type
        )));
    }

    let offset = offset
        .checked_add(name_size)
        .map(align4)
        .ok_or_else(|| SmithError::Format("truncated build-id note".to_string()))?
        as usize;
    let desc = offset
        .checked_add(desc_size as usize)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| SmithError::Format("truncated build-id note".to_string()))?;
    Ok(hex::encode(desc))
}

/// Decode a `.gnu_debuglink` (or `.gnu_debugaltlink`) payload: a
/// NUL-terminated file name followed by a CRC we don't need.
pub(crate) fn decode_debug_link(data: &[u8]) -> Result<String> {
    let idx = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| SmithError::Format("malformed debug link".to_string()))?;
    if idx == 0 {
        return Err(SmithError::Format("malformed debug link".to_string()));
    }
    String::from_utf8(data[..idx].to_vec())
        .map_err(|_| SmithError::Format("malformed debug link".to_string()))
}
