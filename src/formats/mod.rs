//! Format detection and memory-map construction.
//!
//! Every supported container format is a [`FormatParser`]: a bounded,
//! header-only validity check plus a memory-map builder. The
//! [`FormatRegistry`] asks each parser whether it recognizes a device,
//! collects the matching [`FileType`] tags and resolves polyglots through the
//! declared [`FileType::PRIORITY`] order.
//!
//! Supported formats:
//! - ELF (Executable and Linkable Format)
//! - PE/COFF (Portable Executable)
//! - Mach-O (Mach Object)
//! - MS-DOS MZ, with NE and LE/LX tagging
//! - Amiga Hunk
//! - PNG, ar archives and BOM-tagged text (extra formats)
//! - Raw binary fallback

pub mod amiga_hunk;
pub mod ar;
pub mod elf;
pub mod macho;
pub mod mz;
pub mod pe;
pub mod png;
pub mod text;

use crate::error::Result;
use crate::io::Device;
use crate::memory_map::MemoryMap;
use crate::types::FileType;
use std::collections::BTreeSet;

/// Magic byte signatures for format detection.
pub mod magic {
    /// ELF magic bytes: 0x7F 'E' 'L' 'F'
    pub const ELF: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    /// DOS stub magic: 'M' 'Z'
    pub const MZ: [u8; 2] = [b'M', b'Z'];

    /// Obsolete byte-swapped DOS magic: 'Z' 'M'
    pub const ZM: [u8; 2] = [b'Z', b'M'];

    /// PE signature: 'P' 'E' '\0' '\0'
    pub const PE: [u8; 4] = [b'P', b'E', 0, 0];

    /// Mach-O 32-bit, as a native-order `u32`
    pub const MACHO_32: u32 = 0xFEED_FACE;

    /// Mach-O 64-bit, as a native-order `u32`
    pub const MACHO_64: u32 = 0xFEED_FACF;

    /// Amiga `HUNK_HEADER` block id (big-endian)
    pub const AMIGA_HUNK_HEADER: [u8; 4] = [0x00, 0x00, 0x03, 0xF3];

    /// PNG file signature
    pub const PNG: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];

    /// ar archive magic: "!<arch>\n"
    pub const AR: [u8; 8] = [b'!', b'<', b'a', b'r', b'c', b'h', b'>', b'\n'];

    /// UTF-8 byte order mark
    pub const BOM_UTF8: [u8; 3] = [0xEF, 0xBB, 0xBF];

    /// UTF-16 little-endian byte order mark
    pub const BOM_UTF16_LE: [u8; 2] = [0xFF, 0xFE];

    /// UTF-16 big-endian byte order mark
    pub const BOM_UTF16_BE: [u8; 2] = [0xFE, 0xFF];
}

/// A format collaborator.
///
/// `is_valid` must only consult header-region bytes and sizes; it never scans
/// the payload. `memory_map` may walk structural metadata but not the whole
/// file.
pub trait FormatParser: Send + Sync {
    /// The generic tag this parser is registered under.
    fn file_type(&self) -> FileType;

    /// Extra formats (images, archives, text) are only reported on request.
    fn is_extra(&self) -> bool {
        false
    }

    /// Bounded header check.
    fn is_valid(&self, device: &mut Device<'_>) -> bool;

    /// Every tag this device carries for this parser, generic first.
    ///
    /// Only meaningful when [`FormatParser::is_valid`] holds.
    fn file_types(&self, device: &mut Device<'_>) -> Vec<FileType> {
        let _ = device;
        vec![self.file_type()]
    }

    /// Build the address space described by the device's structures.
    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap>;
}

/// Fallback for any byte stream: a flat map with address == offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryParser;

impl FormatParser for BinaryParser {
    fn file_type(&self) -> FileType {
        FileType::Binary
    }

    fn is_valid(&self, _device: &mut Device<'_>) -> bool {
        true
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let size = if device.is_size_known() {
            device.size()
        } else {
            0
        };
        Ok(MemoryMap::flat(size))
    }
}

/// Ordered set of format collaborators.
pub struct FormatRegistry {
    parsers: Vec<Box<dyn FormatParser>>,
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<FileType> = self.parsers.iter().map(|p| p.file_type()).collect();
        f.debug_struct("FormatRegistry")
            .field("parsers", &types)
            .finish()
    }
}

impl Default for FormatRegistry {
    /// Every built-in parser, with the binary fallback last.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(elf::ElfParser);
        registry.register(pe::PeParser);
        registry.register(macho::MachOParser);
        registry.register(mz::MzParser);
        registry.register(amiga_hunk::AmigaHunkParser);
        registry.register(png::PngParser);
        registry.register(ar::ArParser);
        registry.register(text::TextParser);
        registry.register(BinaryParser);
        registry
    }
}

impl FormatRegistry {
    /// A registry with no parsers.
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Append a parser.
    pub fn register(&mut self, parser: impl FormatParser + 'static) {
        self.parsers.push(Box::new(parser));
    }

    /// Registered parsers in registration order.
    pub fn parsers(&self) -> impl Iterator<Item = &dyn FormatParser> {
        self.parsers.iter().map(|p| p.as_ref())
    }

    /// Every tag any parser claims for `device`.
    ///
    /// Extra formats are skipped unless `include_extra` is set. An empty
    /// result is reported as `{Unknown}`.
    pub fn detect_types(&self, device: &mut Device<'_>, include_extra: bool) -> BTreeSet<FileType> {
        let mut types = BTreeSet::new();
        for parser in self.parsers() {
            if parser.is_extra() && !include_extra {
                continue;
            }
            if parser.is_valid(device) {
                let found = parser.file_types(device);
                tracing::trace!(parser = %parser.file_type(), ?found, "format matched");
                types.extend(found);
            }
        }
        if types.is_empty() {
            types.insert(FileType::Unknown);
        }
        tracing::debug!(?types, "detected file types");
        types
    }

    /// The single preferred tag for `device`, extras included.
    pub fn preferred_type(&self, device: &mut Device<'_>) -> FileType {
        preferred_of(&self.detect_types(device, true))
    }

    /// Build the memory map of the most preferred type that maps cleanly.
    ///
    /// A parser that fails is logged and skipped; the flat binary map is the
    /// last resort.
    pub fn memory_map(&self, device: &mut Device<'_>) -> MemoryMap {
        let mut candidates: Vec<(FileType, &dyn FormatParser)> = Vec::new();
        for parser in self.parsers() {
            if parser.is_valid(device) {
                let best = preferred_of(&parser.file_types(device).into_iter().collect());
                candidates.push((best, parser));
            }
        }
        candidates.sort_by_key(|(file_type, _)| file_type.priority());

        for (file_type, parser) in candidates {
            match parser.memory_map(device) {
                Ok(map) => {
                    tracing::debug!(%file_type, records = map.records().len(), "memory map built");
                    return map;
                }
                Err(err) => {
                    tracing::warn!(%file_type, error = %err, "format parser failed, trying next");
                }
            }
        }
        let size = if device.is_size_known() {
            device.size()
        } else {
            0
        };
        MemoryMap::flat(size)
    }

    /// Build the memory map for one specific tag.
    ///
    /// Returns `None` when no registered parser claims `file_type` here.
    pub fn memory_map_for(
        &self,
        device: &mut Device<'_>,
        file_type: FileType,
    ) -> Option<Result<MemoryMap>> {
        for parser in self.parsers() {
            if parser.is_valid(device) && parser.file_types(device).contains(&file_type) {
                return Some(parser.memory_map(device));
            }
        }
        None
    }
}

/// Resolve a set of tags through [`FileType::PRIORITY`].
pub fn preferred_of(types: &BTreeSet<FileType>) -> FileType {
    types
        .iter()
        .copied()
        .min_by_key(|t| t.priority())
        .unwrap_or(FileType::Unknown)
}

/// Whether `[offset, offset + size)` lies inside the device.
fn fits(device: &Device<'_>, offset: u64, size: u64) -> bool {
    size == 0 || device.is_offset_and_size_valid(offset, size)
}

/// Trim a fixed-width name field at the first NUL.
fn field_name(raw: &[u8]) -> String {
    let end = memchr::memchr(0, raw).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}
