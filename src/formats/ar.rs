//! ar archive collaborator (extra format).
//!
//! ar archives are used for Unix static libraries (.a files) and Windows
//! import libraries. Each member's data becomes one file segment.

use super::{fits, magic, FormatParser};
use crate::error::{EngineError, Result};
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{FileType, Mode};

/// ar member header size
pub const AR_MEMBER_HEADER_SIZE: u64 = 60;

/// ar member header field offsets
pub mod ar_header {
    pub const NAME_SIZE: usize = 16;
    pub const SIZE_OFFSET: u64 = 48;
    pub const SIZE_SIZE: usize = 10;
    pub const FMAG_OFFSET: u64 = 58;
    pub const FMAG: [u8; 2] = [b'`', b'\n'];
}

/// Upper bound on members walked for one map.
const MAX_MEMBERS: usize = 0x1_0000;

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArMember {
    /// Member name with the GNU trailing `/` removed.
    pub name: String,
    /// Offset of the member header.
    pub header_offset: u64,
    /// Offset of the member data.
    pub data_offset: u64,
    /// Data size.
    pub size: u64,
}

fn parse_decimal(raw: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    if text.is_empty() {
        return Some(0);
    }
    text.parse().ok()
}

/// ar archive parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArParser;

impl ArParser {
    /// Members in archive order.
    ///
    /// A header with a bad terminator ends the walk with an error; a
    /// truncated last member is clamped to the file.
    pub fn members(&self, device: &mut Device<'_>) -> Result<Vec<ArMember>> {
        let mut members = Vec::new();
        let mut offset = magic::AR.len() as u64;
        while fits(device, offset, AR_MEMBER_HEADER_SIZE) && members.len() < MAX_MEMBERS {
            if device.read_array::<2>(offset + ar_header::FMAG_OFFSET) != ar_header::FMAG {
                return Err(EngineError::invalid_format(
                    "ar",
                    format!("bad member header terminator at 0x{offset:X}"),
                ));
            }
            let raw_name = device.read_bytes(offset, ar_header::NAME_SIZE);
            let name = String::from_utf8_lossy(&raw_name).trim_end().to_string();
            let name = match name.strip_suffix('/') {
                Some(stripped) if !stripped.is_empty() => stripped.to_string(),
                _ => name,
            };
            let raw_size = device.read_bytes(offset + ar_header::SIZE_OFFSET, ar_header::SIZE_SIZE);
            let size = parse_decimal(&raw_size).ok_or_else(|| {
                EngineError::invalid_format("ar", format!("bad member size at 0x{offset:X}"))
            })?;

            let data_offset = offset + AR_MEMBER_HEADER_SIZE;
            let available = device.size().saturating_sub(data_offset);
            members.push(ArMember {
                name,
                header_offset: offset,
                data_offset,
                size: size.min(available),
            });
            // Member data is padded to an even offset.
            offset = data_offset.saturating_add(size).saturating_add(size & 1);
        }
        Ok(members)
    }
}

impl FormatParser for ArParser {
    fn file_type(&self) -> FileType {
        FileType::Ar
    }

    fn is_extra(&self) -> bool {
        true
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        device.starts_with_at(0, &magic::AR)
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let members = self.members(device)?;

        let mut map = MemoryMap::new(FileType::Ar);
        map.mode = Mode::Data;
        map.type_name = "Archive".to_string();
        let signature = magic::AR.len() as u64;
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, Some(0), signature).named("Signature"),
        );
        let mut raw_end = signature;
        for member in &members {
            map.push_record(
                MemoryRecord::physical(
                    RecordKind::Header,
                    member.header_offset,
                    Some(member.header_offset),
                    AR_MEMBER_HEADER_SIZE,
                )
                .named(format!("{} header", member.name)),
            );
            if member.size > 0 {
                map.push_record(
                    MemoryRecord::physical(
                        RecordKind::FileSegment,
                        member.data_offset,
                        Some(member.data_offset),
                        member.size,
                    )
                    .named(member.name.clone()),
                );
            }
            raw_end = member.data_offset + member.size + (member.size & 1);
        }
        if device.is_size_known() {
            raw_end = raw_end.min(device.size());
            map.add_overlay(raw_end, device.size());
        }
        map.raw_size = raw_end;
        map.image_size = raw_end;
        tracing::debug!(members = members.len(), "ar memory map");
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn member(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = format!("{name:<16}{:<12}{:<6}{:<6}{:<8}{:<10}", 0, 0, 0, 644, data.len())
            .into_bytes();
        header.extend_from_slice(&ar_header::FMAG);
        assert_eq!(header.len(), 60);
        header.extend_from_slice(data);
        if data.len() % 2 == 1 {
            header.push(b'\n');
        }
        header
    }

    fn sample() -> Vec<u8> {
        let mut data = magic::AR.to_vec();
        data.extend(member("hello.o/", b"odd"));
        data.extend(member("world.o/", b"even"));
        data
    }

    #[test]
    fn test_members() {
        let mut data = sample();
        let mut dev = Device::new(&mut data);
        assert!(ArParser.is_valid(&mut dev));
        let members = ArParser.members(&mut dev).unwrap();
        assert_eq!(
            members,
            vec![
                ArMember {
                    name: "hello.o".to_string(),
                    header_offset: 8,
                    data_offset: 68,
                    size: 3,
                },
                ArMember {
                    name: "world.o".to_string(),
                    header_offset: 72,
                    data_offset: 132,
                    size: 4,
                },
            ]
        );
    }

    #[test]
    fn test_memory_map() {
        let mut data = sample();
        let mut dev = Device::new(&mut data);
        let map = ArParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.file_type, FileType::Ar);
        assert_eq!(map.raw_size, 136);
        assert_eq!(map.record_info_by_offset(69), "hello.o");
        assert_eq!(map.record_info_by_offset(80), "world.o header");
        assert!(!map.is_overlay_present());
    }

    #[test]
    fn test_bad_terminator() {
        let mut data = sample();
        data[8 + 58] = b'x';
        let mut dev = Device::new(&mut data);
        assert!(ArParser.memory_map(&mut dev).is_err());
    }
}
