//! PE/COFF (Portable Executable) collaborator.
//!
//! The header region and every section are mapped at `ImageBase + RVA`.
//! A section whose virtual size exceeds its raw data gets a virtual tail.

use super::{field_name, fits, magic, FormatParser};
use crate::error::{EngineError, Result};
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{Endianness, FileType, Mode};

/// PE machine type constants.
pub mod machine {
    pub const I386: u16 = 0x014C;
    pub const ARM: u16 = 0x01C0;
    pub const ARMNT: u16 = 0x01C4;
    pub const IA64: u16 = 0x0200;
    pub const RISCV64: u16 = 0x5064;
    pub const AMD64: u16 = 0x8664;
    pub const ARM64: u16 = 0xAA64;
}

/// PE optional header magic values.
pub mod optional_magic {
    pub const PE32: u16 = 0x10B;
    pub const PE32_PLUS: u16 = 0x20B;
}

/// `IMAGE_FILE_DLL` characteristic.
const CHARACTERISTIC_DLL: u16 = 0x2000;
/// `IMAGE_FILE_EXECUTABLE_IMAGE` characteristic.
const CHARACTERISTIC_EXECUTABLE: u16 = 0x0002;

/// Size of one section table entry.
pub const SECTION_HEADER_SIZE: u64 = 40;

/// Loader limit on the number of sections.
const MAX_SECTIONS: u16 = 96;

/// Architecture label for a COFF machine value.
pub fn machine_name(value: u16) -> String {
    let name = match value {
        machine::I386 => "386",
        machine::ARM => "ARM",
        machine::ARMNT => "ARMNT",
        machine::IA64 => "IA64",
        machine::RISCV64 => "RISCV64",
        machine::AMD64 => "AMD64",
        machine::ARM64 => "ARM64",
        other => return format!("0x{other:04X}"),
    };
    name.to_string()
}

/// One section table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section name, NUL-trimmed.
    pub name: String,
    /// `VirtualSize`
    pub virtual_size: u32,
    /// `VirtualAddress` (RVA)
    pub virtual_address: u32,
    /// `SizeOfRawData`
    pub raw_size: u32,
    /// `PointerToRawData`
    pub raw_offset: u32,
}

/// PE32/PE32+ parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeParser;

impl PeParser {
    /// Offset of the `PE\0\0` signature, if present.
    pub fn pe_offset(device: &mut Device<'_>) -> Option<u64> {
        if !device.starts_with_at(0, &magic::MZ) || !fits(device, 0, 0x40) {
            return None;
        }
        let lfanew = u64::from(device.read_u32(0x3C, Endianness::Little));
        // Signature plus COFF file header.
        if !fits(device, lfanew, 24) || !device.starts_with_at(lfanew, &magic::PE) {
            return None;
        }
        Some(lfanew)
    }

    fn optional_magic(device: &mut Device<'_>, pe_offset: u64) -> u16 {
        device.read_u16(pe_offset + 24, Endianness::Little)
    }

    /// Section table entries.
    pub fn sections(&self, device: &mut Device<'_>) -> Result<Vec<SectionHeader>> {
        let pe_offset = Self::pe_offset(device)
            .ok_or_else(|| EngineError::invalid_format("PE", "missing PE signature"))?;
        let le = Endianness::Little;
        let count = device.read_u16(pe_offset + 6, le);
        let optional_size = u64::from(device.read_u16(pe_offset + 20, le));
        let table = pe_offset + 24 + optional_size;
        if count > MAX_SECTIONS || !fits(device, table, SECTION_HEADER_SIZE * u64::from(count)) {
            return Err(EngineError::invalid_format(
                "PE",
                format!("section table of {count} entries at 0x{table:X} exceeds the file"),
            ));
        }
        Ok((0..u64::from(count))
            .map(|i| {
                let at = table + i * SECTION_HEADER_SIZE;
                let raw_name = device.read_array::<8>(at);
                SectionHeader {
                    name: field_name(&raw_name),
                    virtual_size: device.read_u32(at + 8, le),
                    virtual_address: device.read_u32(at + 12, le),
                    raw_size: device.read_u32(at + 16, le),
                    raw_offset: device.read_u32(at + 20, le),
                }
            })
            .collect())
    }
}

impl FormatParser for PeParser {
    fn file_type(&self) -> FileType {
        FileType::Pe
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        Self::pe_offset(device).is_some()
    }

    fn file_types(&self, device: &mut Device<'_>) -> Vec<FileType> {
        let Some(pe_offset) = Self::pe_offset(device) else {
            return vec![FileType::Pe];
        };
        match Self::optional_magic(device, pe_offset) {
            optional_magic::PE32 => vec![FileType::Pe, FileType::Pe32],
            optional_magic::PE32_PLUS => vec![FileType::Pe, FileType::Pe64],
            _ => vec![FileType::Pe],
        }
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let pe_offset = Self::pe_offset(device)
            .ok_or_else(|| EngineError::invalid_format("PE", "missing PE signature"))?;
        let le = Endianness::Little;
        let is_64 = match Self::optional_magic(device, pe_offset) {
            optional_magic::PE32 => false,
            optional_magic::PE32_PLUS => true,
            other => {
                return Err(EngineError::invalid_format(
                    "PE",
                    format!("unknown optional header magic 0x{other:X}"),
                ))
            }
        };
        let sections = self.sections(device)?;

        let coff_machine = device.read_u16(pe_offset + 4, le);
        let characteristics = device.read_u16(pe_offset + 22, le);
        let optional = pe_offset + 24;
        let entry_rva = u64::from(device.read_u32(optional + 16, le));
        let image_base = if is_64 {
            device.read_u64(optional + 24, le)
        } else {
            u64::from(device.read_u32(optional + 28, le))
        };
        let image_size = u64::from(device.read_u32(optional + 56, le));
        let headers_size = u64::from(device.read_u32(optional + 60, le));

        let mut map = MemoryMap::new(if is_64 { FileType::Pe64 } else { FileType::Pe32 });
        map.module_address = image_base;
        map.image_size = image_size;
        map.mode = if is_64 { Mode::Bits64 } else { Mode::Bits32 };
        map.endianness = le;
        map.arch = machine_name(coff_machine);
        map.type_name = if characteristics & CHARACTERISTIC_DLL != 0 {
            "DLL"
        } else if characteristics & CHARACTERISTIC_EXECUTABLE != 0 {
            "EXE"
        } else {
            "OBJ"
        }
        .to_string();

        let section_table_end =
            pe_offset + 24 + u64::from(device.read_u16(pe_offset + 20, le))
                + SECTION_HEADER_SIZE * sections.len() as u64;
        let headers_size = headers_size.max(section_table_end);
        let wraps = |what: String| {
            EngineError::invalid_format("PE", format!("{what} wraps the address space"))
        };
        if image_base.checked_add(image_size.max(headers_size)).is_none() {
            return Err(wraps(format!("image at 0x{image_base:X}")));
        }
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, Some(image_base), headers_size)
                .named("Header"),
        );

        let mut raw_end = headers_size;
        for (index, section) in sections.iter().enumerate() {
            let load_section = u32::try_from(index).unwrap_or(u32::MAX);
            let virtual_size = u64::from(section.virtual_size);
            let address = image_base
                .checked_add(u64::from(section.virtual_address))
                .filter(|a| a.checked_add(virtual_size.max(u64::from(section.raw_size))).is_some())
                .ok_or_else(|| wraps(format!("section {}", section.name)))?;
            let mut raw_size = u64::from(section.raw_size);
            if virtual_size > 0 {
                raw_size = raw_size.min(virtual_size);
            }
            let raw_offset = u64::from(section.raw_offset);
            if raw_size > 0 && raw_offset > 0 {
                map.push_record(
                    MemoryRecord::physical(
                        RecordKind::LoadSegment,
                        raw_offset,
                        Some(address),
                        raw_size,
                    )
                    .named(section.name.clone())
                    .with_load_section(load_section),
                );
                raw_end = raw_end.max(raw_offset + u64::from(section.raw_size));
            } else {
                raw_size = 0;
            }
            if virtual_size > raw_size {
                map.push_record(
                    MemoryRecord::virtual_region(
                        RecordKind::LoadSegment,
                        address + raw_size,
                        virtual_size - raw_size,
                    )
                    .named(section.name.clone())
                    .with_load_section(load_section),
                );
            }
        }

        map.entry_point_address = (entry_rva != 0)
            .then(|| image_base.checked_add(entry_rva))
            .flatten();
        map.raw_size = raw_end;
        if device.is_size_known() {
            map.add_overlay(raw_end, device.size());
        }
        tracing::debug!(
            arch = %map.arch,
            sections = sections.len(),
            overlay = map.is_overlay_present(),
            "PE memory map"
        );
        Ok(map)
    }
}
