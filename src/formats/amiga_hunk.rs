//! Amiga Hunk executable collaborator.
//!
//! Hunk files are a big-endian stream of longword-tagged blocks. The
//! `HUNK_HEADER` table gives each hunk's allocation size; hunks are laid out
//! back to back from address 0 in table order.

use super::{fits, magic, FormatParser};
use crate::error::{EngineError, Result};
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{Endianness, FileType, Mode};

/// Hunk block ids.
pub mod hunk {
    pub const NAME: u32 = 0x3E8;
    pub const CODE: u32 = 0x3E9;
    pub const DATA: u32 = 0x3EA;
    pub const BSS: u32 = 0x3EB;
    pub const RELOC32: u32 = 0x3EC;
    pub const RELOC16: u32 = 0x3ED;
    pub const RELOC8: u32 = 0x3EE;
    pub const EXT: u32 = 0x3EF;
    pub const SYMBOL: u32 = 0x3F0;
    pub const DEBUG: u32 = 0x3F1;
    pub const END: u32 = 0x3F2;
    pub const HEADER: u32 = 0x3F3;
    pub const OVERLAY: u32 = 0x3F5;
    pub const BREAK: u32 = 0x3F6;
    pub const DREL32: u32 = 0x3F7;
    pub const DREL16: u32 = 0x3F8;
    pub const DREL8: u32 = 0x3F9;
    pub const RELOC32SHORT: u32 = 0x3FC;
}

/// Smallest header: id, empty name list, table size, first, last, one size.
const MIN_HEADER_SIZE: u64 = 24;

/// Upper bound on hunks in one file.
const MAX_HUNKS: u32 = 0x1000;

/// Memory flags live in the top two bits of ids and sizes.
const FLAGS_MASK: u32 = 0x3FFF_FFFF;

/// One hunk block found while walking the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// `CODE`, `DATA` or `BSS`.
    pub kind: u32,
    /// Offset of the hunk payload, `None` for BSS.
    pub offset: Option<u64>,
    /// Bytes stored in the file.
    pub file_size: u64,
    /// Bytes allocated at load time.
    pub memory_size: u64,
}

impl Hunk {
    fn name(&self) -> &'static str {
        match self.kind {
            hunk::CODE => "CODE",
            hunk::DATA => "DATA",
            _ => "BSS",
        }
    }
}

/// Longword reader that refuses to run past the end.
struct Reader<'d, 'a> {
    device: &'d mut Device<'a>,
    pos: u64,
}

impl Reader<'_, '_> {
    fn long(&mut self) -> Result<u32> {
        if !fits(self.device, self.pos, 4) {
            return Err(EngineError::Truncated {
                offset: self.pos,
                expected: 4,
                actual: 0,
            });
        }
        let value = self.device.read_u32(self.pos, Endianness::Big);
        self.pos += 4;
        Ok(value)
    }

    fn word(&mut self) -> Result<u16> {
        if !fits(self.device, self.pos, 2) {
            return Err(EngineError::Truncated {
                offset: self.pos,
                expected: 2,
                actual: 0,
            });
        }
        let value = self.device.read_u16(self.pos, Endianness::Big);
        self.pos += 2;
        Ok(value)
    }

    fn skip(&mut self, bytes: u64) -> Result<()> {
        if !fits(self.device, self.pos, bytes) {
            return Err(EngineError::invalid_format(
                "Amiga Hunk",
                format!("block of {bytes} bytes at 0x{:X} exceeds the file", self.pos),
            ));
        }
        self.pos += bytes;
        Ok(())
    }

    fn skip_longs(&mut self, count: u32) -> Result<()> {
        self.skip(u64::from(count) * 4)
    }
}

/// Amiga Hunk parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmigaHunkParser;

impl AmigaHunkParser {
    /// Allocation sizes from the header table, plus the offset the hunk
    /// stream starts at.
    fn header(reader: &mut Reader<'_, '_>) -> Result<Vec<u64>> {
        reader.pos = 4;
        loop {
            let name_longs = reader.long()?;
            if name_longs == 0 {
                break;
            }
            reader.skip_longs(name_longs)?;
        }
        let table_size = reader.long()?;
        let first = reader.long()?;
        let last = reader.long()?;
        if last < first || last - first >= table_size.min(MAX_HUNKS) {
            return Err(EngineError::invalid_format(
                "Amiga Hunk",
                format!("bad hunk range {first}..={last} for table of {table_size}"),
            ));
        }
        let mut sizes = Vec::new();
        for _ in first..=last {
            let raw = reader.long()?;
            if raw >> 30 == 3 {
                // extended memory attributes
                reader.long()?;
            }
            sizes.push(u64::from(raw & FLAGS_MASK) * 4);
        }
        Ok(sizes)
    }

    /// Walk every hunk. Returns the hunks, the header end and the end of
    /// the last parsed block.
    pub fn hunks(&self, device: &mut Device<'_>) -> Result<(Vec<Hunk>, u64, u64)> {
        let mut reader = Reader { device, pos: 0 };
        let sizes = Self::header(&mut reader)?;
        let header_end = reader.pos;

        let mut hunks: Vec<Hunk> = Vec::new();
        let mut index = 0;
        while index < sizes.len() && fits(reader.device, reader.pos, 4) {
            let id = reader.long()? & FLAGS_MASK;
            match id {
                hunk::CODE | hunk::DATA => {
                    let file_size = u64::from(reader.long()?) * 4;
                    let offset = reader.pos;
                    reader.skip(file_size)?;
                    hunks.push(Hunk {
                        kind: id,
                        offset: Some(offset),
                        file_size,
                        memory_size: sizes[index].max(file_size),
                    });
                }
                hunk::BSS => {
                    let longs = u64::from(reader.long()?);
                    hunks.push(Hunk {
                        kind: id,
                        offset: None,
                        file_size: 0,
                        memory_size: sizes[index].max(longs * 4),
                    });
                }
                hunk::RELOC32 | hunk::RELOC16 | hunk::RELOC8 | hunk::DREL16 | hunk::DREL8 => {
                    loop {
                        let count = reader.long()?;
                        if count == 0 {
                            break;
                        }
                        reader.skip_longs(count.saturating_add(1))?;
                    }
                }
                hunk::RELOC32SHORT | hunk::DREL32 => {
                    loop {
                        let count = reader.word()?;
                        if count == 0 {
                            break;
                        }
                        reader.skip((u64::from(count) + 1) * 2)?;
                    }
                    if reader.pos % 4 != 0 {
                        reader.skip(2)?;
                    }
                }
                hunk::SYMBOL => loop {
                    let name_longs = reader.long()?;
                    if name_longs == 0 {
                        break;
                    }
                    reader.skip_longs(name_longs.saturating_add(1))?;
                },
                hunk::NAME | hunk::DEBUG => {
                    let longs = reader.long()?;
                    reader.skip_longs(longs)?;
                }
                hunk::EXT => loop {
                    let tag = reader.long()?;
                    if tag == 0 {
                        break;
                    }
                    let kind = tag >> 24;
                    reader.skip_longs(tag & 0x00FF_FFFF)?;
                    match kind {
                        // definitions carry a value
                        0..=0x7F => reader.skip(4)?,
                        // common symbols carry a size, then references
                        130 => {
                            reader.skip(4)?;
                            let refs = reader.long()?;
                            reader.skip_longs(refs)?;
                        }
                        _ => {
                            let refs = reader.long()?;
                            reader.skip_longs(refs)?;
                        }
                    }
                },
                hunk::END => index += 1,
                hunk::OVERLAY | hunk::BREAK => break,
                other => {
                    return Err(EngineError::invalid_format(
                        "Amiga Hunk",
                        format!("unknown block 0x{other:X} at 0x{:X}", reader.pos - 4),
                    ))
                }
            }
        }
        Ok((hunks, header_end, reader.pos))
    }
}

impl FormatParser for AmigaHunkParser {
    fn file_type(&self) -> FileType {
        FileType::AmigaHunk
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        device.starts_with_at(0, &magic::AMIGA_HUNK_HEADER) && fits(device, 0, MIN_HEADER_SIZE)
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let (hunks, header_end, raw_end) = self.hunks(device)?;

        let mut map = MemoryMap::new(FileType::AmigaHunk);
        map.mode = Mode::Bits32;
        map.endianness = Endianness::Big;
        map.arch = "68000".to_string();
        map.type_name = "EXEC".to_string();
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, None, header_end).named("Header"),
        );

        let mut address = 0u64;
        for (index, hunk) in hunks.iter().enumerate() {
            let load_section = u32::try_from(index).unwrap_or(u32::MAX);
            let stored = hunk.file_size.min(hunk.memory_size);
            if let Some(offset) = hunk.offset.filter(|_| stored > 0) {
                map.push_record(
                    MemoryRecord::physical(RecordKind::LoadSegment, offset, Some(address), stored)
                        .named(hunk.name())
                        .with_load_section(load_section),
                );
            }
            if hunk.memory_size > stored {
                map.push_record(
                    MemoryRecord::virtual_region(
                        RecordKind::LoadSegment,
                        address + stored,
                        hunk.memory_size - stored,
                    )
                    .named(hunk.name())
                    .with_load_section(load_section),
                );
            }
            address += hunk.memory_size;
        }

        map.image_size = address;
        map.entry_point_address = (!hunks.is_empty()).then_some(0);
        map.raw_size = raw_end;
        if device.is_size_known() {
            map.add_overlay(raw_end, device.size());
        }
        tracing::debug!(hunks = hunks.len(), raw_size = raw_end, "Amiga Hunk memory map");
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn longs(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    /// Two hunks: CODE of 2 longs (allocated 4) and BSS of 8 longs.
    fn sample() -> Vec<u8> {
        longs(&[
            hunk::HEADER,
            0, // no resident libraries
            2,
            0,
            1,
            4,
            8,
            hunk::CODE,
            2,
            0x4E75_4E75,
            0x4E71_4E71,
            hunk::RELOC32,
            1,
            0,
            0,
            0,
            hunk::END,
            hunk::BSS,
            8,
            hunk::END,
        ])
    }

    #[test]
    fn test_detect() {
        let mut data = sample();
        let mut dev = Device::new(&mut data);
        assert!(AmigaHunkParser.is_valid(&mut dev));

        let mut short = longs(&[hunk::HEADER, 0]);
        let mut dev = Device::new(&mut short);
        assert!(!AmigaHunkParser.is_valid(&mut dev));
    }

    #[test]
    fn test_hunk_walk() {
        let mut data = sample();
        let mut dev = Device::new(&mut data);
        let (hunks, header_end, raw_end) = AmigaHunkParser.hunks(&mut dev).unwrap();
        assert_eq!(header_end, 28);
        assert_eq!(raw_end, 80);
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].offset, Some(36));
        assert_eq!(hunks[0].file_size, 8);
        assert_eq!(hunks[0].memory_size, 16);
        assert_eq!(hunks[1].offset, None);
        assert_eq!(hunks[1].memory_size, 32);
    }

    #[test]
    fn test_memory_map() {
        let mut data = sample();
        data.extend_from_slice(b"tail");
        let mut dev = Device::new(&mut data);
        let map = AmigaHunkParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.endianness, Endianness::Big);
        assert_eq!(map.image_size, 48);
        assert_eq!(map.entry_point_offset(), Some(36));
        assert_eq!(map.address_to_offset(4), Some(40));
        assert!(map.is_address_valid(12));
        assert!(!map.is_address_physical(12));
        assert_eq!(map.address_to_load_section(20), Some(1));
        assert_eq!(map.record_info_by_address(20), "BSS");
        assert_eq!(map.overlay().map(|r| r.size), Some(4));
    }

    #[test]
    fn test_bad_range_and_unknown_block() {
        let mut data = longs(&[hunk::HEADER, 0, 1, 0, 3, 4, 4, 4, 4]);
        let mut dev = Device::new(&mut data);
        assert!(AmigaHunkParser.memory_map(&mut dev).is_err());

        let mut data = longs(&[hunk::HEADER, 0, 1, 0, 0, 4, 0x123]);
        let mut dev = Device::new(&mut data);
        assert!(matches!(
            AmigaHunkParser.memory_map(&mut dev),
            Err(EngineError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_hostile_sizes_are_rejected() {
        // Hunk range far beyond the table cap.
        let mut data = longs(&[hunk::HEADER, 0, u32::MAX, 0, u32::MAX - 1, 4]);
        let mut dev = Device::new(&mut data);
        assert!(AmigaHunkParser.memory_map(&mut dev).is_err());

        // Resident name list claiming four billion longwords.
        let mut data = longs(&[hunk::HEADER, u32::MAX, 0, 1, 0, 0, 4]);
        let mut dev = Device::new(&mut data);
        assert!(AmigaHunkParser.memory_map(&mut dev).is_err());

        // CODE block whose payload runs past the end.
        let mut data = longs(&[hunk::HEADER, 0, 1, 0, 0, 4, hunk::CODE, 0x3FFF_FFFF, 0]);
        let mut dev = Device::new(&mut data);
        assert!(matches!(
            AmigaHunkParser.memory_map(&mut dev),
            Err(EngineError::InvalidFormat { .. })
        ));

        // Largest allocation flags and sizes still map without wrapping.
        let mut data = longs(&[hunk::HEADER, 0, 2, 0, 1, 0xBFFF_FFFF, 0x7FFF_FFFF]);
        data.extend(longs(&[hunk::BSS, 0, hunk::END, hunk::BSS, 0, hunk::END]));
        let mut dev = Device::new(&mut data);
        let map = AmigaHunkParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.image_size, 2 * u64::from(FLAGS_MASK) * 4);
    }
}
