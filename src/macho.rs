use std::collections::HashMap;
use std::fs::{self, File};
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use object::{
    Architecture, CompressionFormat, FileKind, Object, ObjectSection, ObjectSegment, Section,
};

use crate::error::ContainerError;
use crate::types::FileAddr;

/// Segment holding executable code; crash addresses are relative to it.
pub const TEXT_SEGMENT: &str = "__TEXT";

/// Sections handed to the DWARF reader, under their ELF-style names.
const DEBUG_SECTIONS: &[&str] = &[
    ".debug_info",
    ".debug_abbrev",
    ".debug_str",
    ".debug_str_offsets",
    ".debug_addr",
    ".debug_line",
    ".debug_line_str",
    ".debug_ranges",
    ".debug_rnglists",
];

/// A read-only, memory-mapped Mach-O image (an executable or a dSYM
/// companion). Load commands are parsed once in [`MachO::open`]; section
/// contents are borrowed from the mapping, which is released when the value
/// is dropped.
pub struct MachO {
    pub path: PathBuf,
    mmap: Mmap,
    segments: Vec<(String, FileAddr)>,
    sections: HashMap<&'static str, Range<usize>>,
    uuid: Option<[u8; 16]>,
    arch: Architecture,
}

impl MachO {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| ContainerError::Open {
            path: path.clone(),
            source,
        })?;

        // SAFETY: the mapping is read-only and nothing in this process
        // writes to the file while it is mapped.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| ContainerError::Open {
            path: path.clone(),
            source,
        })?;

        match FileKind::parse(&*mmap) {
            Ok(FileKind::MachOFat32 | FileKind::MachOFat64) => {
                return Err(ContainerError::FatBinary { path });
            }
            Ok(kind) => debug!("{}: {kind:?}, {} bytes", path.display(), mmap.len()),
            Err(source) => return Err(ContainerError::Malformed { path, source }),
        }

        let (segments, sections, uuid, arch) = {
            let object = object::File::parse(&*mmap).map_err(|source| {
                ContainerError::Malformed {
                    path: path.clone(),
                    source,
                }
            })?;

            let segments = object
                .segments()
                .filter_map(|segment| {
                    let name = segment.name().ok().flatten()?;
                    Some((name.to_string(), FileAddr(segment.address())))
                })
                .collect::<Vec<_>>();

            let mut sections = HashMap::new();
            for &name in DEBUG_SECTIONS {
                if let Some(range) = object
                    .section_by_name(name)
                    .and_then(|section| file_range(&section))
                {
                    sections.insert(name, range);
                }
            }

            let uuid = object.mach_uuid().ok().flatten();
            (segments, sections, uuid, object.architecture())
        };

        Ok(Self {
            path,
            mmap,
            segments,
            sections,
            uuid,
            arch,
        })
    }

    /// Returns the link-time base address of the named segment.
    pub fn segment_base_address(&self, name: &str) -> Result<FileAddr, ContainerError> {
        self.segments
            .iter()
            .find(|(segment, _)| segment == name)
            .map(|(_, base)| *base)
            .ok_or_else(|| ContainerError::SegmentNotFound {
                path: self.path.clone(),
                segment: name.to_string(),
            })
    }

    /// Returns the bytes of a DWARF section. ELF-style names such as
    /// `.debug_info` match Mach-O's `__debug_info`.
    pub fn section_data(&self, name: &str) -> Option<&[u8]> {
        let range = self.sections.get(name)?;
        self.mmap.get(range.clone())
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.uuid
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }
}

/// Where a section's contents live in the file. Zero-fill and compressed
/// sections have nothing to borrow.
fn file_range(section: &Section<'_, '_>) -> Option<Range<usize>> {
    let compressed = section.compressed_file_range().ok()?;
    if compressed.format != CompressionFormat::None {
        debug!(
            "ignoring compressed section {}",
            section.name().unwrap_or("<unnamed>")
        );
        return None;
    }
    let (offset, size) = section.file_range()?;
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    Some(start..end)
}

/// Accepts either a DWARF file or a `.dSYM` bundle directory, in which case
/// the single file under `Contents/Resources/DWARF` is returned.
pub fn resolve_dsym_path(path: impl AsRef<Path>) -> Result<PathBuf, ContainerError> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Ok(path.to_path_buf());
    }

    let dwarf_dir = path.join("Contents").join("Resources").join("DWARF");
    let entries = fs::read_dir(&dwarf_dir).map_err(|source| ContainerError::Open {
        path: dwarf_dir.clone(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ContainerError::Open {
            path: dwarf_dir.clone(),
            source,
        })?;
        if entry.path().is_file() {
            files.push(entry.path());
        }
    }

    match files.as_slice() {
        [single] => {
            debug!("dSYM bundle {} -> {}", path.display(), single.display());
            Ok(single.clone())
        }
        _ => Err(ContainerError::BundleLayout {
            path: path.to_path_buf(),
        }),
    }
}

/// Formats a Mach-O UUID the way `dwarfdump --uuid` prints it.
pub fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex: String = uuid.iter().map(|b| format!("{b:02X}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
