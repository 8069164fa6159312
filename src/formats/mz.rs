//! DOS MZ collaborator, with NE and LE/LX tagging.
//!
//! - MZ: original DOS executable (16-bit real mode)
//! - NE: New Executable for 16-bit Windows and OS/2
//! - LE/LX: Linear Executable for OS/2 32-bit and VxD drivers
//!
//! The map always describes the DOS image: header, load module and overlay.
//! A new-style header found through `e_lfanew` only adds a tag and a
//! non-loadable record.

use super::{fits, magic, FormatParser};
use crate::error::{EngineError, Result};
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{Endianness, FileType, Mode};

/// NE header signature.
pub const NE_SIGNATURE: [u8; 2] = [b'N', b'E'];

/// LE header signature.
pub const LE_SIGNATURE: [u8; 2] = [b'L', b'E'];

/// LX header signature.
pub const LX_SIGNATURE: [u8; 2] = [b'L', b'X'];

/// Bytes of the MZ header that carry fields.
pub const MZ_FIELDS_SIZE: u64 = 0x1C;

/// Full MZ header size, including `e_lfanew`.
pub const MZ_HEADER_SIZE: u64 = 0x40;

/// NE header size.
pub const NE_HEADER_SIZE: u64 = 0x40;

/// LE/LX header size.
pub const LE_HEADER_SIZE: u64 = 0xC4;

const PAGE_SIZE: u64 = 512;
const PARAGRAPH: u64 = 16;

/// Extended header kind found through `e_lfanew`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedType {
    /// NE (New Executable)
    Ne,
    /// LE (Linear Executable)
    Le,
    /// LX (Linear Executable Extended)
    Lx,
}

impl ExtendedType {
    fn file_type(self) -> FileType {
        match self {
            ExtendedType::Ne => FileType::Ne,
            ExtendedType::Le => FileType::Le,
            ExtendedType::Lx => FileType::Lx,
        }
    }

    fn header_size(self) -> u64 {
        match self {
            ExtendedType::Ne => NE_HEADER_SIZE,
            ExtendedType::Le | ExtendedType::Lx => LE_HEADER_SIZE,
        }
    }
}

/// DOS MZ parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct MzParser;

impl MzParser {
    /// The new-style header referenced by `e_lfanew`, if any.
    pub fn extended(device: &mut Device<'_>) -> Option<(ExtendedType, u64)> {
        if !fits(device, 0, MZ_HEADER_SIZE) {
            return None;
        }
        let lfanew = u64::from(device.read_u32(0x3C, Endianness::Little));
        if lfanew < MZ_HEADER_SIZE || !fits(device, lfanew, 2) {
            return None;
        }
        let kind = match device.read_array::<2>(lfanew) {
            NE_SIGNATURE => ExtendedType::Ne,
            LE_SIGNATURE => ExtendedType::Le,
            LX_SIGNATURE => ExtendedType::Lx,
            _ => return None,
        };
        Some((kind, lfanew))
    }
}

impl FormatParser for MzParser {
    fn file_type(&self) -> FileType {
        FileType::MsDos
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        (device.starts_with_at(0, &magic::MZ) || device.starts_with_at(0, &magic::ZM))
            && fits(device, 0, MZ_FIELDS_SIZE)
    }

    fn file_types(&self, device: &mut Device<'_>) -> Vec<FileType> {
        let mut types = vec![FileType::MsDos];
        if let Some((kind, _)) = Self::extended(device) {
            types.push(kind.file_type());
        }
        types
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let le = Endianness::Little;
        let bytes_last_page = u64::from(device.read_u16(2, le));
        let pages = u64::from(device.read_u16(4, le));
        let header_paragraphs = u64::from(device.read_u16(8, le));
        let ip = u64::from(device.read_u16(0x14, le));
        let cs = device.read_u16(0x16, le);

        let image_end = match (pages, bytes_last_page) {
            (0, _) => 0,
            (p, 0) => p * PAGE_SIZE,
            (p, last) => (p - 1) * PAGE_SIZE + last,
        };
        let header_size = header_paragraphs * PARAGRAPH;
        if image_end == 0 || header_size > image_end {
            return Err(EngineError::invalid_format(
                "MSDOS",
                format!("header of {header_size} bytes does not fit image of {image_end} bytes"),
            ));
        }

        let available = if device.is_size_known() {
            image_end.min(device.size())
        } else {
            image_end
        };
        let load_size = available.saturating_sub(header_size);

        let mut map = MemoryMap::new(FileType::MsDos);
        map.mode = Mode::Bits16Seg;
        map.endianness = le;
        map.arch = "8086".to_string();
        map.type_name = "EXE".to_string();
        map.image_size = image_end - header_size;

        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, None, header_size.min(available))
                .named("Header"),
        );
        if load_size > 0 {
            map.push_record(
                MemoryRecord::physical(RecordKind::LoadSegment, header_size, Some(0), load_size)
                    .named("Load module")
                    .with_segment(0)
                    .with_load_section(0),
            );
        }

        // CS is relative to the load segment and wraps in the 1 MiB space.
        let entry = (u64::from(cs) * PARAGRAPH + ip) & 0xF_FFFF;
        map.entry_point_address = Some(entry);
        map.raw_size = image_end;

        if let Some((kind, lfanew)) = Self::extended(device) {
            let size = if device.is_size_known() {
                kind.header_size().min(device.size() - lfanew)
            } else {
                kind.header_size()
            };
            map.file_type = kind.file_type();
            map.type_name = kind.file_type().name().to_string();
            map.push_record(
                MemoryRecord::physical(RecordKind::NonLoadable, lfanew, None, size)
                    .named(format!("{} header", kind.file_type().name())),
            );
        }

        if device.is_size_known() {
            map.add_overlay(image_end, device.size());
        }
        tracing::debug!(
            file_type = %map.file_type,
            image_end,
            entry = format_args!("{cs:04X}:{ip:04X}"),
            "MZ memory map"
        );
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    /// Two pages, last one 0x100 bytes: image of 0x300 bytes with a
    /// 0x20-byte header. Entry at 0010:0004.
    fn minimal_mz(file_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; file_size];
        data[0..2].copy_from_slice(&magic::MZ);
        LittleEndian::write_u16(&mut data[2..], 0x100);
        LittleEndian::write_u16(&mut data[4..], 2);
        LittleEndian::write_u16(&mut data[8..], 2);
        LittleEndian::write_u16(&mut data[0x14..], 4);
        LittleEndian::write_u16(&mut data[0x16..], 0x10);
        data
    }

    #[test]
    fn test_mz_memory_map() {
        let mut data = minimal_mz(0x340);
        let mut dev = Device::new(&mut data);
        assert!(MzParser.is_valid(&mut dev));
        assert_eq!(MzParser.file_types(&mut dev), vec![FileType::MsDos]);

        let map = MzParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.file_type, FileType::MsDos);
        assert_eq!(map.mode, Mode::Bits16Seg);
        assert_eq!(map.raw_size, 0x300);
        assert_eq!(map.image_size, 0x2E0);
        assert_eq!(map.entry_point_address, Some(0x104));
        assert_eq!(map.entry_point_offset(), Some(0x124));
        assert_eq!(map.offset_to_address(0x20), Some(0));
        assert_eq!(map.offset_to_address(0x10), None);
        assert_eq!(map.overlay().map(|r| (r.file_offset, r.size)), Some((Some(0x300), 0x40)));
    }

    #[test]
    fn test_truncated_image_is_clamped() {
        let mut data = minimal_mz(0x100);
        let mut dev = Device::new(&mut data);
        let map = MzParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.raw_size, 0x300);
        assert_eq!(map.records()[1].size, 0xE0);
        assert!(!map.is_overlay_present());
    }

    #[test]
    fn test_zm_signature_and_bad_header() {
        let mut data = minimal_mz(0x300);
        data[0..2].copy_from_slice(&magic::ZM);
        LittleEndian::write_u16(&mut data[8..], 0x100);
        let mut dev = Device::new(&mut data);
        assert!(MzParser.is_valid(&mut dev));
        assert!(MzParser.memory_map(&mut dev).is_err());
    }

    #[test]
    fn test_ne_and_lx_tags() {
        for (sig, expected) in [
            (NE_SIGNATURE, FileType::Ne),
            (LE_SIGNATURE, FileType::Le),
            (LX_SIGNATURE, FileType::Lx),
        ] {
            let mut data = minimal_mz(0x400);
            LittleEndian::write_u32(&mut data[0x3C..], 0x300);
            data[0x300..0x302].copy_from_slice(&sig);
            let mut dev = Device::new(&mut data);
            assert_eq!(MzParser.file_types(&mut dev), vec![FileType::MsDos, expected]);
            let map = MzParser.memory_map(&mut dev).unwrap();
            assert_eq!(map.file_type, expected);
            assert_eq!(map.record_info_by_offset(0x300), format!("{} header", expected.name()));
        }
    }

    #[test]
    fn test_lfanew_inside_header_is_ignored() {
        let mut data = minimal_mz(0x300);
        LittleEndian::write_u32(&mut data[0x3C..], 0x10);
        data[0x10..0x12].copy_from_slice(&NE_SIGNATURE);
        let mut dev = Device::new(&mut data);
        assert_eq!(MzParser.file_types(&mut dev), vec![FileType::MsDos]);
    }

    #[test]
    fn test_hostile_header_fields() {
        let mut data = minimal_mz(0x200);
        LittleEndian::write_u16(&mut data[2..], 0xFFFF);
        LittleEndian::write_u16(&mut data[4..], 0xFFFF);
        LittleEndian::write_u16(&mut data[8..], 0x10);
        LittleEndian::write_u16(&mut data[0x14..], 0xFFFF);
        LittleEndian::write_u16(&mut data[0x16..], 0xFFFF);
        LittleEndian::write_u32(&mut data[0x3C..], u32::MAX);
        let mut dev = Device::new(&mut data);
        assert_eq!(MzParser.file_types(&mut dev), vec![FileType::MsDos]);
        let map = MzParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.raw_size, 0xFFFE * 512 + 0xFFFF);
        assert_eq!(map.records()[1].size, 0x100);
        assert_eq!(map.entry_point_address, Some(0xFFEF));
        assert!(!map.is_overlay_present());
    }
}
