//! PNG image collaborator (extra format).
//!
//! The format size is found by walking chunks up to `IEND`; anything after
//! it is an overlay.

use super::{fits, magic, FormatParser};
use crate::error::Result;
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{Endianness, FileType, Mode};

/// Smallest accepted file: signature plus one chunk header.
pub const MIN_SIZE: u64 = 20;

/// Length, type and CRC around each chunk's data.
const CHUNK_OVERHEAD: u64 = 12;

/// One chunk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the length field.
    pub offset: u64,
    /// Four-character chunk type.
    pub name: String,
    /// Data length.
    pub data_size: u64,
    /// Stored CRC.
    pub crc: u32,
}

fn read_chunk(device: &mut Device<'_>, offset: u64) -> Chunk {
    let data_size = u64::from(device.read_u32(offset, Endianness::Big));
    let name = device.read_ansi_string(offset + 4, 4);
    let crc = device.read_u32(offset + 8 + data_size, Endianness::Big);
    Chunk {
        offset,
        name,
        data_size,
        crc,
    }
}

/// PNG parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngParser;

impl PngParser {
    /// Chunks up to and including `IEND`, and the offset just past it.
    ///
    /// The end is `None` when the walk leaves the file or meets a zero CRC
    /// before `IEND`.
    pub fn chunks(&self, device: &mut Device<'_>) -> (Vec<Chunk>, Option<u64>) {
        let mut chunks = Vec::new();
        let mut offset = magic::PNG.len() as u64;
        while fits(device, offset, CHUNK_OVERHEAD) {
            let chunk = read_chunk(device, offset);
            let next = offset
                .saturating_add(CHUNK_OVERHEAD)
                .saturating_add(chunk.data_size);
            let is_end = chunk.name == "IEND";
            let crc = chunk.crc;
            chunks.push(chunk);
            if is_end {
                return (chunks, Some(next));
            }
            if crc == 0 {
                break;
            }
            offset = next;
        }
        (chunks, None)
    }

    /// Offset just past `IEND`, if the chunk walk reaches it.
    pub fn format_size(&self, device: &mut Device<'_>) -> Option<u64> {
        self.chunks(device).1
    }
}

impl FormatParser for PngParser {
    fn file_type(&self) -> FileType {
        FileType::Png
    }

    fn is_extra(&self) -> bool {
        true
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        fits(device, 0, MIN_SIZE) && device.starts_with_at(0, &magic::PNG)
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let file_size = if device.is_size_known() {
            device.size()
        } else {
            0
        };
        let (chunks, end) = self.chunks(device);
        let raw_end = end.unwrap_or(file_size);

        let mut map = MemoryMap::new(FileType::Png);
        map.mode = Mode::Data;
        map.endianness = Endianness::Big;
        map.type_name = "Image".to_string();
        map.image_size = raw_end;
        map.raw_size = raw_end;
        let signature = magic::PNG.len() as u64;
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, Some(0), signature).named("Signature"),
        );
        for chunk in &chunks {
            let size = (chunk.data_size + CHUNK_OVERHEAD).min(raw_end.saturating_sub(chunk.offset));
            if size == 0 {
                continue;
            }
            map.push_record(
                MemoryRecord::physical(RecordKind::FileSegment, chunk.offset, Some(chunk.offset), size)
                    .named(chunk.name.clone()),
            );
        }
        map.add_overlay(raw_end, file_size);
        tracing::debug!(chunks = chunks.len(), complete = end.is_some(), "PNG memory map");
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(name: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(name);
        out.extend_from_slice(data);
        out.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        out
    }

    fn sample() -> Vec<u8> {
        let mut data = magic::PNG.to_vec();
        data.extend(chunk(b"IHDR", &[0u8; 13]));
        data.extend(chunk(b"IDAT", b"pixels"));
        data.extend(chunk(b"IEND", &[]));
        data
    }

    #[test]
    fn test_detect() {
        let mut data = sample();
        let mut dev = Device::new(&mut data);
        assert!(PngParser.is_valid(&mut dev));
        assert!(PngParser.is_extra());

        let mut short = magic::PNG.to_vec();
        let mut dev = Device::new(&mut short);
        assert!(!PngParser.is_valid(&mut dev));
    }

    #[test]
    fn test_format_size_stops_at_iend() {
        let mut data = sample();
        let expected = data.len() as u64;
        data.extend_from_slice(b"appended");
        let mut dev = Device::new(&mut data);
        assert_eq!(PngParser.format_size(&mut dev), Some(expected));

        let map = PngParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.raw_size, expected);
        assert_eq!(map.record_info_by_offset(8), "IHDR");
        assert_eq!(map.record_info_by_offset(8 + 25 + 4), "IDAT");
        assert_eq!(map.overlay().map(|r| r.size), Some(8));
    }

    #[test]
    fn test_missing_iend() {
        let mut data = magic::PNG.to_vec();
        data.extend(chunk(b"IHDR", &[0u8; 13]));
        let mut dev = Device::new(&mut data);
        assert_eq!(PngParser.format_size(&mut dev), None);
        let map = PngParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.raw_size, 33);
        assert!(!map.is_overlay_present());
    }

    #[test]
    fn test_chunk_length_past_end() {
        let mut data = magic::PNG.to_vec();
        data.extend(chunk(b"IHDR", &[0u8; 13]));
        let hostile = data.len();
        data.extend(chunk(b"IDAT", b"pixels"));
        data[hostile..hostile + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut dev = Device::new(&mut data);
        assert_eq!(PngParser.format_size(&mut dev), None);
        let map = PngParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.raw_size, data.len() as u64);
        // The runaway chunk is clamped to the file.
        let idat = map.record_by_offset(hostile as u64).unwrap();
        assert_eq!(idat.name, "IDAT");
        assert_eq!(idat.size, (data.len() - hostile) as u64);
    }
}
