//! Memory records: one mapped region of a binary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a memory record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// File header region.
    Header,
    /// Segment or section loaded into memory.
    LoadSegment,
    /// Region present in the file but not loaded.
    NonLoadable,
    /// Plain file region (flat maps, archives, images).
    FileSegment,
    /// Trailing bytes past the structural end of the binary.
    Overlay,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordKind::Header => "header",
            RecordKind::LoadSegment => "segment",
            RecordKind::NonLoadable => "non-loadable",
            RecordKind::FileSegment => "file",
            RecordKind::Overlay => "overlay",
        };
        write!(f, "{s}")
    }
}

/// One region of an address space.
///
/// `file_offset` is `None` for virtual records (memory the loader
/// synthesizes, such as `.bss` tails); those never take part in offset
/// translation. `address` is `None` for regions that are never mapped, such
/// as overlays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Offset in the file, `None` if virtual.
    pub file_offset: Option<u64>,
    /// Virtual address, `None` if not mapped.
    pub address: Option<u64>,
    /// Segment selector for segmented (real mode) images.
    pub segment: Option<u16>,
    /// Size in bytes.
    pub size: u64,
    /// Record kind.
    pub kind: RecordKind,
    /// Index of the load section this record belongs to.
    pub load_section: Option<u32>,
    /// Display name (section name, "Header", "Overlay", ...).
    pub name: String,
    /// Position in the owning map's record list.
    pub index: usize,
}

impl MemoryRecord {
    /// A record backed by file bytes.
    pub fn physical(kind: RecordKind, file_offset: u64, address: Option<u64>, size: u64) -> Self {
        Self {
            file_offset: Some(file_offset),
            address,
            segment: None,
            size,
            kind,
            load_section: None,
            name: String::new(),
            index: 0,
        }
    }

    /// A record with an address but no file bytes.
    pub fn virtual_region(kind: RecordKind, address: u64, size: u64) -> Self {
        Self {
            file_offset: None,
            address: Some(address),
            segment: None,
            size,
            kind,
            load_section: None,
            name: String::new(),
            index: 0,
        }
    }

    /// Set the display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the load section index.
    pub fn with_load_section(mut self, section: u32) -> Self {
        self.load_section = Some(section);
        self
    }

    /// Set the segment selector.
    pub fn with_segment(mut self, segment: u16) -> Self {
        self.segment = Some(segment);
        self
    }

    /// Whether the record has no file bytes.
    pub fn is_virtual(&self) -> bool {
        self.file_offset.is_none()
    }

    /// Half-open file range, if physical.
    pub fn offset_range(&self) -> Option<(u64, u64)> {
        self.file_offset
            .map(|o| (o, o.saturating_add(self.size)))
    }

    /// Half-open address range, if mapped.
    pub fn address_range(&self) -> Option<(u64, u64)> {
        self.address.map(|a| (a, a.saturating_add(self.size)))
    }

    /// Whether `offset` falls inside the record's file range.
    pub fn contains_offset(&self, offset: u64) -> bool {
        self.offset_range()
            .map_or(false, |(start, end)| offset >= start && offset < end)
    }

    /// Whether `address` falls inside the record's address range.
    pub fn contains_address(&self, address: u64) -> bool {
        self.address_range()
            .map_or(false, |(start, end)| address >= start && address < end)
    }
}

impl fmt::Display for MemoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.file_offset {
            Some(o) => write!(f, "{o:#010x}")?,
            None => write!(f, "{:>10}", "-")?,
        }
        match self.address {
            Some(a) => write!(f, " {a:#018x}")?,
            None => write!(f, " {:>18}", "-")?,
        }
        write!(f, " {:#010x} {:<12} {}", self.size, self.kind, self.name)
    }
}
