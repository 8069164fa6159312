//! Mach-O collaborator.
//!
//! Thin 32/64-bit images in either byte order. Segments come from
//! `LC_SEGMENT`/`LC_SEGMENT_64`; the entry point from `LC_MAIN`.

use super::{field_name, fits, magic, FormatParser};
use crate::error::{EngineError, Result};
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{Endianness, FileType, Mode};

/// CPU type constants.
pub mod cpu_type {
    pub const X86: u32 = 7;
    pub const X86_64: u32 = 0x0100_0007;
    pub const ARM: u32 = 12;
    pub const ARM64: u32 = 0x0100_000C;
    pub const POWERPC: u32 = 18;
    pub const POWERPC64: u32 = 0x0100_0012;
}

/// Load command ids.
pub mod load_command {
    pub const LC_SEGMENT: u32 = 0x1;
    pub const LC_SEGMENT_64: u32 = 0x19;
    pub const LC_MAIN: u32 = 0x8000_0028;
}

/// Upper bound on load commands walked for one map.
const MAX_LOAD_COMMANDS: u32 = 0x1000;

/// Architecture label for a `cputype` value.
pub fn cpu_name(value: u32) -> String {
    let name = match value {
        cpu_type::X86 => "386",
        cpu_type::X86_64 => "AMD64",
        cpu_type::ARM => "ARM",
        cpu_type::ARM64 => "ARM64",
        cpu_type::POWERPC => "PPC",
        cpu_type::POWERPC64 => "PPC64",
        other => return format!("0x{other:X}"),
    };
    name.to_string()
}

fn file_type_name(value: u32) -> &'static str {
    match value {
        1 => "OBJECT",
        2 => "EXECUTE",
        6 => "DYLIB",
        7 => "DYLINKER",
        8 => "BUNDLE",
        _ => "UNKNOWN",
    }
}

/// One decoded segment command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// `segname`
    pub name: String,
    /// `vmaddr`
    pub address: u64,
    /// `vmsize`
    pub memory_size: u64,
    /// `fileoff`
    pub offset: u64,
    /// `filesize`
    pub file_size: u64,
}

/// Thin Mach-O parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachOParser;

impl MachOParser {
    /// `(is_64, byte order)` from the magic.
    fn ident(device: &mut Device<'_>) -> Option<(bool, Endianness)> {
        let (is_64, endian) = match device.read_u32(0, Endianness::Little) {
            magic::MACHO_32 => (false, Endianness::Little),
            magic::MACHO_64 => (true, Endianness::Little),
            _ => match device.read_u32(0, Endianness::Big) {
                magic::MACHO_32 => (false, Endianness::Big),
                magic::MACHO_64 => (true, Endianness::Big),
                _ => return None,
            },
        };
        fits(device, 0, Self::header_size(is_64)).then_some((is_64, endian))
    }

    fn header_size(is_64: bool) -> u64 {
        if is_64 {
            32
        } else {
            28
        }
    }

    /// Segments plus the `LC_MAIN` entry offset, if any.
    pub fn load_commands(&self, device: &mut Device<'_>) -> Result<(Vec<Segment>, Option<u64>)> {
        let (is_64, endian) = Self::ident(device)
            .ok_or_else(|| EngineError::invalid_format("Mach-O", "bad magic"))?;
        let ncmds = device.read_u32(16, endian);
        let sizeofcmds = u64::from(device.read_u32(20, endian));
        let start = Self::header_size(is_64);
        if ncmds > MAX_LOAD_COMMANDS || !fits(device, start, sizeofcmds) {
            return Err(EngineError::invalid_format(
                "Mach-O",
                format!("{ncmds} load commands ({sizeofcmds} bytes) exceed the file"),
            ));
        }

        let end = start + sizeofcmds;
        let mut segments = Vec::new();
        let mut entry_offset = None;
        let mut at = start;
        for _ in 0..ncmds {
            if at + 8 > end {
                break;
            }
            let cmd = device.read_u32(at, endian);
            let cmdsize = u64::from(device.read_u32(at + 4, endian));
            if cmdsize < 8 || at + cmdsize > end {
                return Err(EngineError::invalid_format(
                    "Mach-O",
                    format!("load command at 0x{at:X} has bad size {cmdsize}"),
                ));
            }
            match cmd {
                load_command::LC_SEGMENT if cmdsize >= 56 => {
                    segments.push(Segment {
                        name: field_name(&device.read_array::<16>(at + 8)),
                        address: u64::from(device.read_u32(at + 24, endian)),
                        memory_size: u64::from(device.read_u32(at + 28, endian)),
                        offset: u64::from(device.read_u32(at + 32, endian)),
                        file_size: u64::from(device.read_u32(at + 36, endian)),
                    });
                }
                load_command::LC_SEGMENT_64 if cmdsize >= 72 => {
                    segments.push(Segment {
                        name: field_name(&device.read_array::<16>(at + 8)),
                        address: device.read_u64(at + 24, endian),
                        memory_size: device.read_u64(at + 32, endian),
                        offset: device.read_u64(at + 40, endian),
                        file_size: device.read_u64(at + 48, endian),
                    });
                }
                load_command::LC_MAIN if cmdsize >= 24 => {
                    entry_offset = Some(device.read_u64(at + 8, endian));
                }
                _ => {}
            }
            at += cmdsize;
        }
        Ok((segments, entry_offset))
    }
}

impl FormatParser for MachOParser {
    fn file_type(&self) -> FileType {
        FileType::MachO
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        Self::ident(device).is_some()
    }

    fn file_types(&self, device: &mut Device<'_>) -> Vec<FileType> {
        match Self::ident(device) {
            Some((true, _)) => vec![FileType::MachO, FileType::MachO64],
            Some((false, _)) => vec![FileType::MachO, FileType::MachO32],
            None => vec![FileType::MachO],
        }
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let (is_64, endian) = Self::ident(device)
            .ok_or_else(|| EngineError::invalid_format("Mach-O", "bad magic"))?;
        let (segments, entry_offset) = self.load_commands(device)?;
        if let Some(segment) = segments.iter().find(|s| {
            s.address.checked_add(s.memory_size.max(s.file_size)).is_none()
                || s.offset.checked_add(s.file_size).is_none()
        }) {
            return Err(EngineError::invalid_format(
                "Mach-O",
                format!("segment {} at 0x{:X} wraps the address space", segment.name, segment.address),
            ));
        }
        let cputype = device.read_u32(4, endian);
        let filetype = device.read_u32(12, endian);
        let header_end = Self::header_size(is_64) + u64::from(device.read_u32(20, endian));

        let mut map = MemoryMap::new(if is_64 {
            FileType::MachO64
        } else {
            FileType::MachO32
        });
        map.mode = if is_64 { Mode::Bits64 } else { Mode::Bits32 };
        map.endianness = endian;
        map.arch = cpu_name(cputype);
        map.type_name = file_type_name(filetype).to_string();

        let header_address = segments
            .iter()
            .find(|s| s.offset == 0 && s.file_size > 0)
            .map(|s| s.address);
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, header_address, header_end)
                .named("Header"),
        );

        let mut raw_end = header_end;
        for (index, segment) in segments.iter().enumerate() {
            let load_section = u32::try_from(index).unwrap_or(u32::MAX);
            let file_size = segment.file_size;
            if file_size > 0 {
                map.push_record(
                    MemoryRecord::physical(
                        RecordKind::LoadSegment,
                        segment.offset,
                        Some(segment.address),
                        file_size,
                    )
                    .named(segment.name.clone())
                    .with_load_section(load_section),
                );
                raw_end = raw_end.max(segment.offset.saturating_add(file_size));
            }
            if segment.memory_size > file_size {
                map.push_record(
                    MemoryRecord::virtual_region(
                        RecordKind::LoadSegment,
                        segment.address + file_size,
                        segment.memory_size - file_size,
                    )
                    .named(segment.name.clone())
                    .with_load_section(load_section),
                );
            }
        }

        // __PAGEZERO-style guard segments carry no file bytes.
        let loaded = || segments.iter().filter(|s| s.file_size > 0);
        if let (Some(low), Some(high)) = (
            loaded().map(|s| s.address).min(),
            loaded()
                .map(|s| s.address + s.memory_size)
                .max(),
        ) {
            map.module_address = low;
            map.image_size = high - low;
        }
        map.entry_point_address = entry_offset.and_then(|o| map.offset_to_address(o));
        map.raw_size = raw_end;
        if device.is_size_known() {
            map.add_overlay(raw_end, device.size());
        }
        tracing::debug!(arch = %map.arch, segments = segments.len(), "Mach-O memory map");
        Ok(map)
    }
}
