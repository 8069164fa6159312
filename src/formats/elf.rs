//! ELF (Executable and Linkable Format) collaborator.
//!
//! Maps `PT_LOAD` program headers to load segments. The bytes a segment
//! occupies in memory past its file size become a virtual tail record.

use super::{fits, magic, FormatParser};
use crate::error::{EngineError, Result};
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{Endianness, FileType, Mode};

/// ELF class values (32-bit vs 64-bit)
pub mod class {
    pub const ELFCLASS32: u8 = 1;
    pub const ELFCLASS64: u8 = 2;
}

/// ELF data encoding (endianness)
pub mod data {
    pub const ELFDATA2LSB: u8 = 1; // Little-endian
    pub const ELFDATA2MSB: u8 = 2; // Big-endian
}

/// Program header types.
pub mod segment {
    pub const PT_NULL: u32 = 0;
    pub const PT_LOAD: u32 = 1;
}

/// Upper bound on program headers walked for one map.
const MAX_PROGRAM_HEADERS: u16 = 0x1000;

/// Architecture label for an `e_machine` value.
pub fn machine_name(e_machine: u16) -> String {
    let name = match e_machine {
        0x02 => "SPARC",
        0x03 => "386",
        0x04 => "68K",
        0x08 => "MIPS",
        0x14 => "PPC",
        0x15 => "PPC64",
        0x16 => "S390",
        0x28 => "ARM",
        0x2A => "SH",
        0x2B => "SPARCV9",
        0x32 => "IA64",
        0x3E => "AMD64",
        0xB7 => "AARCH64",
        0xF3 => "RISC-V",
        0x102 => "LOONGARCH",
        other => return format!("0x{other:X}"),
    };
    name.to_string()
}

/// Object file type label for an `e_type` value.
fn type_name(e_type: u16) -> &'static str {
    match e_type {
        1 => "REL",
        2 => "EXEC",
        3 => "DYN",
        4 => "CORE",
        _ => "UNKNOWN",
    }
}

/// Class-dependent header field offsets.
#[derive(Debug, Clone, Copy)]
struct Layout {
    is_64: bool,
    header_size: u64,
    entry: u64,
    phoff: u64,
    shoff: u64,
    phentsize: u64,
    phnum: u64,
    shentsize: u64,
    shnum: u64,
    program_header_size: u64,
}

impl Layout {
    fn for_class(ei_class: u8) -> Option<Self> {
        match ei_class {
            class::ELFCLASS32 => Some(Self {
                is_64: false,
                header_size: 0x34,
                entry: 0x18,
                phoff: 0x1C,
                shoff: 0x20,
                phentsize: 0x2A,
                phnum: 0x2C,
                shentsize: 0x2E,
                shnum: 0x30,
                program_header_size: 0x20,
            }),
            class::ELFCLASS64 => Some(Self {
                is_64: true,
                header_size: 0x40,
                entry: 0x18,
                phoff: 0x20,
                shoff: 0x28,
                phentsize: 0x36,
                phnum: 0x38,
                shentsize: 0x3A,
                shnum: 0x3C,
                program_header_size: 0x38,
            }),
            _ => None,
        }
    }

    fn word(&self, device: &mut Device<'_>, offset: u64, endian: Endianness) -> u64 {
        if self.is_64 {
            device.read_u64(offset, endian)
        } else {
            u64::from(device.read_u32(offset, endian))
        }
    }
}

/// One decoded program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// `p_type`
    pub kind: u32,
    /// `p_offset`
    pub offset: u64,
    /// `p_vaddr`
    pub address: u64,
    /// `p_filesz`
    pub file_size: u64,
    /// `p_memsz`
    pub memory_size: u64,
}

fn read_program_header(
    device: &mut Device<'_>,
    layout: &Layout,
    at: u64,
    endian: Endianness,
) -> ProgramHeader {
    let kind = device.read_u32(at, endian);
    if layout.is_64 {
        ProgramHeader {
            kind,
            offset: device.read_u64(at + 0x08, endian),
            address: device.read_u64(at + 0x10, endian),
            file_size: device.read_u64(at + 0x20, endian),
            memory_size: device.read_u64(at + 0x28, endian),
        }
    } else {
        ProgramHeader {
            kind,
            offset: u64::from(device.read_u32(at + 0x04, endian)),
            address: u64::from(device.read_u32(at + 0x08, endian)),
            file_size: u64::from(device.read_u32(at + 0x10, endian)),
            memory_size: u64::from(device.read_u32(at + 0x14, endian)),
        }
    }
}

/// ELF32/ELF64 parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfParser;

impl ElfParser {
    fn ident(device: &mut Device<'_>) -> Option<(Layout, Endianness)> {
        if !device.starts_with_at(0, &magic::ELF) {
            return None;
        }
        let layout = Layout::for_class(device.read_u8(4))?;
        let endian = match device.read_u8(5) {
            data::ELFDATA2LSB => Endianness::Little,
            data::ELFDATA2MSB => Endianness::Big,
            _ => return None,
        };
        fits(device, 0, layout.header_size).then_some((layout, endian))
    }

    /// Decoded program headers, in file order.
    pub fn program_headers(&self, device: &mut Device<'_>) -> Result<Vec<ProgramHeader>> {
        let (layout, endian) = Self::ident(device)
            .ok_or_else(|| EngineError::invalid_format("ELF", "bad identification"))?;
        let phoff = layout.word(device, layout.phoff, endian);
        let phentsize = u64::from(device.read_u16(layout.phentsize, endian));
        let phnum = device.read_u16(layout.phnum, endian);
        if phnum == 0 {
            return Ok(Vec::new());
        }
        if phentsize < layout.program_header_size {
            return Err(EngineError::invalid_format(
                "ELF",
                format!("program header entry size {phentsize} too small"),
            ));
        }
        if phnum > MAX_PROGRAM_HEADERS || !fits(device, phoff, phentsize * u64::from(phnum)) {
            return Err(EngineError::invalid_format(
                "ELF",
                format!("{phnum} program headers at 0x{phoff:X} exceed the file"),
            ));
        }
        Ok((0..u64::from(phnum))
            .map(|i| read_program_header(device, &layout, phoff + i * phentsize, endian))
            .collect())
    }
}

impl FormatParser for ElfParser {
    fn file_type(&self) -> FileType {
        FileType::Elf
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        Self::ident(device).is_some()
    }

    fn file_types(&self, device: &mut Device<'_>) -> Vec<FileType> {
        match Self::ident(device) {
            Some((layout, _)) if layout.is_64 => vec![FileType::Elf, FileType::Elf64],
            Some(_) => vec![FileType::Elf, FileType::Elf32],
            None => vec![FileType::Elf],
        }
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let (layout, endian) = Self::ident(device)
            .ok_or_else(|| EngineError::invalid_format("ELF", "bad identification"))?;
        let headers = self.program_headers(device)?;

        let e_type = device.read_u16(0x10, endian);
        let e_machine = device.read_u16(0x12, endian);
        let entry = layout.word(device, layout.entry, endian);
        let phoff = layout.word(device, layout.phoff, endian);
        let shoff = layout.word(device, layout.shoff, endian);
        let phentsize = u64::from(device.read_u16(layout.phentsize, endian));
        let shentsize = u64::from(device.read_u16(layout.shentsize, endian));
        let shnum = u64::from(device.read_u16(layout.shnum, endian));

        let mut map = MemoryMap::new(if layout.is_64 {
            FileType::Elf64
        } else {
            FileType::Elf32
        });
        map.mode = if layout.is_64 { Mode::Bits64 } else { Mode::Bits32 };
        map.endianness = endian;
        map.arch = machine_name(e_machine);
        map.type_name = type_name(e_type).to_string();

        let loads: Vec<(usize, ProgramHeader)> = headers
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, ph)| ph.kind == segment::PT_LOAD)
            .collect();
        for (index, ph) in &loads {
            let span = ph.memory_size.max(ph.file_size);
            if ph.address.checked_add(span).is_none()
                || ph.offset.checked_add(ph.file_size).is_none()
            {
                return Err(EngineError::invalid_format(
                    "ELF",
                    format!("segment {index} at 0x{:X} wraps the address space", ph.address),
                ));
            }
        }

        // The header shares the address of a segment that maps offset 0.
        let header_address = loads
            .iter()
            .find(|(_, ph)| ph.offset == 0 && ph.file_size > 0)
            .map(|(_, ph)| ph.address);
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, header_address, layout.header_size)
                .named("Header"),
        );

        let mut raw_end = layout.header_size;
        raw_end = raw_end.max(phoff.saturating_add(phentsize * headers.len() as u64));
        if shoff != 0 {
            raw_end = raw_end.max(shoff.saturating_add(shentsize * shnum));
        }

        for (section, (index, ph)) in loads.iter().enumerate() {
            let section = u32::try_from(section).unwrap_or(u32::MAX);
            let name = format!("Segment({index})");
            let file_size = if ph.memory_size > 0 {
                ph.file_size.min(ph.memory_size)
            } else {
                ph.file_size
            };
            if file_size > 0 {
                map.push_record(
                    MemoryRecord::physical(
                        RecordKind::LoadSegment,
                        ph.offset,
                        Some(ph.address),
                        file_size,
                    )
                    .named(name.clone())
                    .with_load_section(section),
                );
                raw_end = raw_end.max(ph.offset.saturating_add(file_size));
            }
            if ph.memory_size > file_size {
                map.push_record(
                    MemoryRecord::virtual_region(
                        RecordKind::LoadSegment,
                        ph.address + file_size,
                        ph.memory_size - file_size,
                    )
                    .named(name)
                    .with_load_section(section),
                );
            }
        }

        let low = loads.iter().map(|(_, ph)| ph.address).min();
        let high = loads
            .iter()
            .map(|(_, ph)| ph.address + ph.memory_size)
            .max();
        if let (Some(low), Some(high)) = (low, high) {
            map.module_address = low;
            map.image_size = high - low;
        }
        map.entry_point_address = (entry != 0).then_some(entry);
        map.raw_size = raw_end;
        if device.is_size_known() {
            map.add_overlay(raw_end, device.size());
        }

        tracing::debug!(
            arch = %map.arch,
            segments = loads.len(),
            raw_size = raw_end,
            "ELF memory map"
        );
        Ok(map)
    }
}
