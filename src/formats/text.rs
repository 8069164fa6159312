//! Text collaborator (extra format).
//!
//! Byte order marks identify UTF-8 and UTF-16 text. Data without a BOM is
//! plain text when its leading bytes are printable ASCII.

use super::{magic, FormatParser};
use crate::error::Result;
use crate::io::Device;
use crate::memory_map::{MemoryMap, MemoryRecord, RecordKind};
use crate::types::{Endianness, FileType, Mode};

/// Bytes inspected for the plain-text check.
const PROBE_SIZE: usize = 0x200;

/// Text encoding found at the start of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    /// No BOM, printable ASCII.
    Plain,
    /// UTF-8 with BOM.
    Utf8,
    /// UTF-16 with a little-endian BOM.
    Utf16Le,
    /// UTF-16 with a big-endian BOM.
    Utf16Be,
}

impl TextKind {
    fn bom_size(self) -> u64 {
        match self {
            TextKind::Plain => 0,
            TextKind::Utf8 => magic::BOM_UTF8.len() as u64,
            TextKind::Utf16Le | TextKind::Utf16Be => 2,
        }
    }

    fn file_types(self) -> Vec<FileType> {
        match self {
            TextKind::Plain => vec![FileType::Text],
            TextKind::Utf8 => vec![FileType::Text, FileType::Utf8],
            TextKind::Utf16Le => vec![FileType::Text, FileType::Unicode, FileType::UnicodeLe],
            TextKind::Utf16Be => vec![FileType::Text, FileType::Unicode, FileType::UnicodeBe],
        }
    }
}

fn is_plain_text_byte(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | b'\r' | 0x20..=0x7E)
}

/// Text parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextParser;

impl TextParser {
    /// Classify the leading bytes.
    pub fn kind(device: &mut Device<'_>) -> Option<TextKind> {
        let head = device.read_bytes(0, PROBE_SIZE);
        if head.starts_with(&magic::BOM_UTF8) {
            Some(TextKind::Utf8)
        } else if head.starts_with(&magic::BOM_UTF16_LE) {
            Some(TextKind::Utf16Le)
        } else if head.starts_with(&magic::BOM_UTF16_BE) {
            Some(TextKind::Utf16Be)
        } else if !head.is_empty() && head.iter().copied().all(is_plain_text_byte) {
            Some(TextKind::Plain)
        } else {
            None
        }
    }
}

impl FormatParser for TextParser {
    fn file_type(&self) -> FileType {
        FileType::Text
    }

    fn is_extra(&self) -> bool {
        true
    }

    fn is_valid(&self, device: &mut Device<'_>) -> bool {
        Self::kind(device).is_some()
    }

    fn file_types(&self, device: &mut Device<'_>) -> Vec<FileType> {
        Self::kind(device).map_or_else(|| vec![FileType::Text], TextKind::file_types)
    }

    fn memory_map(&self, device: &mut Device<'_>) -> Result<MemoryMap> {
        let kind = Self::kind(device).unwrap_or(TextKind::Plain);
        let size = if device.is_size_known() {
            device.size()
        } else {
            0
        };
        let types = kind.file_types();
        let mut map = MemoryMap::new(types.last().copied().unwrap_or(FileType::Text));
        map.mode = Mode::Data;
        map.endianness = if kind == TextKind::Utf16Be {
            Endianness::Big
        } else {
            Endianness::Little
        };
        map.type_name = "Text".to_string();
        map.image_size = size;
        map.raw_size = size;

        let bom = kind.bom_size().min(size);
        if bom > 0 {
            map.push_record(MemoryRecord::physical(RecordKind::Header, 0, Some(0), bom).named("BOM"));
        }
        if size > bom {
            map.push_record(
                MemoryRecord::physical(RecordKind::FileSegment, bom, Some(bom), size - bom)
                    .named("Text"),
            );
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boms() {
        let cases: [(&[u8], Vec<FileType>); 3] = [
            (b"\xEF\xBB\xBFhello", vec![FileType::Text, FileType::Utf8]),
            (
                b"\xFF\xFEh\0i\0",
                vec![FileType::Text, FileType::Unicode, FileType::UnicodeLe],
            ),
            (
                b"\xFE\xFF\0h\0i",
                vec![FileType::Text, FileType::Unicode, FileType::UnicodeBe],
            ),
        ];
        for (bytes, expected) in cases {
            let mut src = bytes;
            let mut dev = Device::new(&mut src);
            assert!(TextParser.is_valid(&mut dev));
            assert_eq!(TextParser.file_types(&mut dev), expected);
        }
    }

    #[test]
    fn test_plain_text() {
        let mut src: &[u8] = b"line one\r\nline two\n";
        let mut dev = Device::new(&mut src);
        assert_eq!(TextParser::kind(&mut dev), Some(TextKind::Plain));

        let mut binary: &[u8] = b"MZ\x90\x00";
        let mut dev = Device::new(&mut binary);
        assert!(!TextParser.is_valid(&mut dev));

        let mut empty: &[u8] = b"";
        let mut dev = Device::new(&mut empty);
        assert!(!TextParser.is_valid(&mut dev));
    }

    #[test]
    fn test_memory_map_skips_bom() {
        let mut src: &[u8] = b"\xEF\xBB\xBFabc";
        let mut dev = Device::new(&mut src);
        let map = TextParser.memory_map(&mut dev).unwrap();
        assert_eq!(map.file_type, FileType::Utf8);
        assert_eq!(map.records().len(), 2);
        assert_eq!(map.record_info_by_offset(0), "BOM");
        assert_eq!(map.record_info_by_offset(3), "Text");
    }
}
