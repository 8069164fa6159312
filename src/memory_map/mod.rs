//! Address spaces and offset/address translation.
//!
//! A [`MemoryMap`] is built by a format collaborator and then queried as a
//! plain value: none of the translation functions touch the byte stream.
//!
//! Records are kept in load order, not address order, and may overlap (a
//! header record usually sits inside the first loadable segment). Every
//! lookup returns the **first record in list order** that contains the
//! query. Lookups go through an interval index built lazily on first use,
//! so they cost one binary search while keeping that exact tie-break.

mod index;
mod record;

pub use record::{MemoryRecord, RecordKind};

use crate::types::{Endianness, FileType, Mode};
use index::IntervalIndex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Default)]
struct Lookup {
    by_offset: IntervalIndex,
    by_address: IntervalIndex,
    by_address_any: IntervalIndex,
}

/// An address space: module base, sizes, entry point and memory records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMap {
    /// Load address of the module.
    pub module_address: u64,
    /// Size of the loaded image.
    pub image_size: u64,
    /// Size of the file as described by its structures.
    pub raw_size: u64,
    /// Entry point address, if the format has one.
    pub entry_point_address: Option<u64>,
    /// Declared file type.
    pub file_type: FileType,
    /// Bit-width mode.
    pub mode: Mode,
    /// Byte order of the described image.
    pub endianness: Endianness,
    /// Architecture label (`"386"`, `"AMD64"`, `"68000"`, ...).
    pub arch: String,
    /// Free-form type label (`"EXEC"`, `"DLL"`, ...).
    pub type_name: String,
    records: Vec<MemoryRecord>,
    #[serde(skip)]
    lookup: OnceLock<Lookup>,
}

impl MemoryMap {
    /// An empty map for `file_type`.
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            ..Self::default()
        }
    }

    /// Identity map over `size` bytes: one file segment, address == offset.
    pub fn flat(size: u64) -> Self {
        let mut map = Self::new(FileType::Binary);
        map.image_size = size;
        map.raw_size = size;
        map.mode = Mode::Data;
        map.type_name = "Binary".to_string();
        if size > 0 {
            map.push_record(
                MemoryRecord::physical(RecordKind::FileSegment, 0, Some(0), size).named("Data"),
            );
        }
        map
    }

    /// Append a record; its `index` is set to its list position.
    pub fn push_record(&mut self, mut record: MemoryRecord) -> usize {
        let index = self.records.len();
        record.index = index;
        self.records.push(record);
        self.lookup = OnceLock::new();
        index
    }

    /// Records in list (load) order.
    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    fn lookup(&self) -> &Lookup {
        self.lookup.get_or_init(|| {
            let physical: Vec<_> = self
                .records
                .iter()
                .filter_map(|r| r.offset_range().map(|(s, e)| (r.index, s, e)))
                .collect();
            let mapped: Vec<_> = self
                .records
                .iter()
                .filter(|r| !r.is_virtual())
                .filter_map(|r| r.address_range().map(|(s, e)| (r.index, s, e)))
                .collect();
            let mapped_any: Vec<_> = self
                .records
                .iter()
                .filter_map(|r| r.address_range().map(|(s, e)| (r.index, s, e)))
                .collect();
            Lookup {
                by_offset: IntervalIndex::build(&physical),
                by_address: IntervalIndex::build(&mapped),
                by_address_any: IntervalIndex::build(&mapped_any),
            }
        })
    }

    /// First physical record containing `offset`.
    pub fn record_by_offset(&self, offset: u64) -> Option<&MemoryRecord> {
        self.lookup()
            .by_offset
            .lookup(offset)
            .and_then(|i| self.records.get(i))
    }

    /// First record, virtual or not, containing `address`.
    pub fn record_by_address(&self, address: u64) -> Option<&MemoryRecord> {
        self.lookup()
            .by_address_any
            .lookup(address)
            .and_then(|i| self.records.get(i))
    }

    /// First record containing the module-relative `rel_address`.
    pub fn record_by_rel_address(&self, rel_address: u64) -> Option<&MemoryRecord> {
        self.rel_address_to_address(rel_address)
            .and_then(|a| self.record_by_address(a))
    }

    /// Index of the first physical record containing `offset`.
    pub fn record_index_by_offset(&self, offset: u64) -> Option<usize> {
        self.record_by_offset(offset).map(|r| r.index)
    }

    /// Index of the first record containing `address`.
    pub fn record_index_by_address(&self, address: u64) -> Option<usize> {
        self.record_by_address(address).map(|r| r.index)
    }

    /// Translate a file offset to a virtual address.
    ///
    /// `None` if unmapped or if the address would not fit in 64 bits.
    pub fn offset_to_address(&self, offset: u64) -> Option<u64> {
        let record = self.record_by_offset(offset)?;
        let base = record.file_offset?;
        record.address?.checked_add(offset - base)
    }

    /// Translate a virtual address to a file offset.
    ///
    /// Virtual records are skipped.
    pub fn address_to_offset(&self, address: u64) -> Option<u64> {
        let record = self
            .lookup()
            .by_address
            .lookup(address)
            .and_then(|i| self.records.get(i))?;
        let base = record.address?;
        record.file_offset?.checked_add(address - base)
    }

    /// Translate a file offset to a module-relative address.
    pub fn offset_to_rel_address(&self, offset: u64) -> Option<u64> {
        self.offset_to_address(offset)
            .and_then(|a| self.address_to_rel_address(a))
    }

    /// Translate a module-relative address to a file offset.
    pub fn rel_address_to_offset(&self, rel_address: u64) -> Option<u64> {
        self.rel_address_to_address(rel_address)
            .and_then(|a| self.address_to_offset(a))
    }

    /// `module_address + rel_address`, if it does not overflow.
    pub fn rel_address_to_address(&self, rel_address: u64) -> Option<u64> {
        self.module_address.checked_add(rel_address)
    }

    /// `address - module_address`, if the address is not below the base.
    pub fn address_to_rel_address(&self, address: u64) -> Option<u64> {
        address.checked_sub(self.module_address)
    }

    /// Whether `offset` lies in a physical record.
    pub fn is_offset_valid(&self, offset: u64) -> bool {
        self.record_by_offset(offset).is_some()
    }

    /// Whether `[offset, offset + size)` lies inside one physical record.
    pub fn is_offset_and_size_valid(&self, offset: u64, size: u64) -> bool {
        let Some(record) = self.record_by_offset(offset) else {
            return false;
        };
        match (record.offset_range(), offset.checked_add(size)) {
            (Some((_, end)), Some(query_end)) => query_end <= end,
            _ => false,
        }
    }

    /// Whether `address` lies in any record, virtual ones included.
    pub fn is_address_valid(&self, address: u64) -> bool {
        self.record_by_address(address).is_some()
    }

    /// Whether the module-relative address lies in any record.
    pub fn is_rel_address_valid(&self, rel_address: u64) -> bool {
        self.rel_address_to_address(rel_address)
            .map_or(false, |a| self.is_address_valid(a))
    }

    /// Whether `address` is backed by file bytes.
    pub fn is_address_physical(&self, address: u64) -> bool {
        self.address_to_offset(address).is_some()
    }

    /// Whether `[address, address + size)` is covered by the single record
    /// that contains `address`.
    pub fn is_solid_address_range(&self, address: u64, size: u64) -> bool {
        let Some(record) = self.record_by_address(address) else {
            return false;
        };
        match (record.address_range(), address.checked_add(size)) {
            (Some((_, end)), Some(query_end)) => query_end <= end,
            _ => false,
        }
    }

    /// Load section of the first record containing `address`.
    pub fn address_to_load_section(&self, address: u64) -> Option<u32> {
        self.record_by_address(address)
            .and_then(|r| r.load_section)
    }

    /// Lowest mapped address of any record.
    pub fn lowest_address(&self) -> Option<u64> {
        self.records.iter().filter_map(|r| r.address).min()
    }

    /// Sum of the sizes of all mapped records except overlays.
    pub fn total_virtual_size(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.kind != RecordKind::Overlay && r.address.is_some())
            .map(|r| r.size)
            .sum()
    }

    /// Number of records backed by file bytes.
    pub fn physical_record_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_virtual()).count()
    }

    /// Number of distinct load sections.
    pub fn load_section_count(&self) -> usize {
        let mut sections: Vec<u32> = self.records.iter().filter_map(|r| r.load_section).collect();
        sections.sort_unstable();
        sections.dedup();
        sections.len()
    }

    /// Highest end offset of any physical record.
    pub fn raw_size_from_records(&self) -> u64 {
        self.records
            .iter()
            .filter_map(MemoryRecord::offset_range)
            .map(|(_, end)| end)
            .max()
            .unwrap_or(0)
    }

    /// File offset of the entry point.
    pub fn entry_point_offset(&self) -> Option<u64> {
        self.entry_point_address
            .and_then(|a| self.address_to_offset(a))
    }

    /// The overlay record, if any.
    pub fn overlay(&self) -> Option<&MemoryRecord> {
        self.records.iter().find(|r| r.kind == RecordKind::Overlay)
    }

    /// Whether the file carries an overlay.
    pub fn is_overlay_present(&self) -> bool {
        self.overlay().map_or(false, |r| r.size > 0)
    }

    /// Name of the record containing `offset`, or an empty string.
    pub fn record_info_by_offset(&self, offset: u64) -> &str {
        self.record_by_offset(offset).map_or("", |r| r.name.as_str())
    }

    /// Name of the record containing `address`, or an empty string.
    pub fn record_info_by_address(&self, address: u64) -> &str {
        self.record_by_address(address)
            .map_or("", |r| r.name.as_str())
    }

    /// Append an overlay record covering `[raw_end, file_size)` if the file
    /// extends past its structural end. Returns the overlay size.
    pub fn add_overlay(&mut self, raw_end: u64, file_size: u64) -> u64 {
        if file_size <= raw_end {
            return 0;
        }
        let size = file_size - raw_end;
        self.push_record(
            MemoryRecord::physical(RecordKind::Overlay, raw_end, None, size).named("Overlay"),
        );
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> MemoryMap {
        let mut map = MemoryMap::new(FileType::Pe32);
        map.module_address = 0x40_0000;
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, Some(0x40_0000), 0x400).named("Header"),
        );
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0x400, Some(0x40_1000), 0x200)
                .named(".text")
                .with_load_section(0),
        );
        map.push_record(
            MemoryRecord::virtual_region(RecordKind::LoadSegment, 0x40_1200, 0xE00)
                .named(".text")
                .with_load_section(0),
        );
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0x600, Some(0x40_2000), 0x100)
                .named(".data")
                .with_load_section(1),
        );
        map.add_overlay(0x700, 0x720);
        map
    }

    #[test]
    fn test_round_trip() {
        let map = sample();
        for record in map.records() {
            let (Some(offset), Some(address)) = (record.file_offset, record.address) else {
                continue;
            };
            for delta in [0, 1, record.size / 2, record.size - 1] {
                let a = address + delta;
                assert_eq!(map.address_to_offset(a), Some(offset + delta));
                assert_eq!(map.offset_to_address(map.address_to_offset(a).unwrap()), Some(a));
            }
        }
    }

    #[test]
    fn test_not_mapped() {
        let map = sample();
        assert_eq!(map.address_to_offset(0x3F_FFFF), None);
        assert_eq!(map.address_to_offset(0x40_2100), None);
        assert_eq!(map.offset_to_address(0x720), None);
        // Overlay bytes exist in the file but have no address.
        assert!(map.is_offset_valid(0x710));
        assert_eq!(map.offset_to_address(0x710), None);
    }

    #[test]
    fn test_virtual_records_skipped() {
        let map = sample();
        assert!(map.is_address_valid(0x40_1800));
        assert!(!map.is_address_physical(0x40_1800));
        assert_eq!(map.address_to_offset(0x40_1800), None);
        assert_eq!(map.address_to_load_section(0x40_1800), Some(0));
    }

    #[test]
    fn test_first_match_in_list_order() {
        let mut map = MemoryMap::new(FileType::Elf64);
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0, Some(0x1000), 0x1000).named("seg0"),
        );
        map.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, Some(0x1000), 0x40).named("Header"),
        );
        assert_eq!(map.record_info_by_address(0x1000), "seg0");
        assert_eq!(map.record_index_by_offset(0x10), Some(0));

        // Appending invalidates the lookup index.
        let mut other = MemoryMap::new(FileType::Elf64);
        other.push_record(
            MemoryRecord::physical(RecordKind::Header, 0, Some(0x1000), 0x40).named("Header"),
        );
        assert_eq!(other.record_info_by_address(0x1000), "Header");
        other.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0x40, Some(0x2000), 0x10).named("seg"),
        );
        assert_eq!(other.record_info_by_address(0x2008), "seg");
    }

    #[test]
    fn test_relative_addresses() {
        let map = sample();
        assert_eq!(map.offset_to_rel_address(0x400), Some(0x1000));
        assert_eq!(map.rel_address_to_offset(0x2010), Some(0x610));
        assert!(map.is_rel_address_valid(0x1FFF));
        assert!(!map.is_rel_address_valid(0x3000));
    }

    #[test]
    fn test_aggregate_queries() {
        let map = sample();
        assert_eq!(map.lowest_address(), Some(0x40_0000));
        assert_eq!(map.total_virtual_size(), 0x400 + 0x200 + 0xE00 + 0x100);
        assert_eq!(map.load_section_count(), 2);
        assert_eq!(map.physical_record_count(), 4);
        assert_eq!(map.raw_size_from_records(), 0x720);
        assert!(map.is_overlay_present());
        assert_eq!(map.overlay().map(|r| r.size), Some(0x20));
        assert!(map.is_solid_address_range(0x40_1000, 0x200));
        assert!(!map.is_solid_address_range(0x40_1000, 0x201));
        assert!(map.is_offset_and_size_valid(0x600, 0x100));
        assert!(!map.is_offset_and_size_valid(0x600, 0x101));
    }

    #[test]
    fn test_translation_near_address_space_end() {
        let mut map = MemoryMap::new(FileType::Elf64);
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0, Some(0xFFFF_FFFF_FFFF_FF00), 0x200)
                .named("high"),
        );
        assert_eq!(map.offset_to_address(0xFF), Some(u64::MAX));
        assert_eq!(map.offset_to_address(0x100), None);
        assert_eq!(map.offset_to_address(0x1FF), None);
        assert_eq!(map.address_to_offset(0xFFFF_FFFF_FFFF_FF10), Some(0x10));

        let mut far = MemoryMap::new(FileType::Elf64);
        far.push_record(MemoryRecord::physical(
            RecordKind::LoadSegment,
            u64::MAX - 0x10,
            Some(0x1000),
            0x100,
        ));
        assert_eq!(far.address_to_offset(0x1020), None);
        assert_eq!(far.address_to_offset(0x1008), Some(u64::MAX - 8));
    }

    #[test]
    fn test_flat() {
        let map = MemoryMap::flat(0x100);
        assert_eq!(map.address_to_offset(0x80), Some(0x80));
        assert_eq!(map.offset_to_address(0xFF), Some(0xFF));
        assert_eq!(map.offset_to_address(0x100), None);
        assert!(MemoryMap::flat(0).records().is_empty());
    }

    #[test]
    fn test_entry_point_offset() {
        let mut map = sample();
        map.entry_point_address = Some(0x40_1010);
        assert_eq!(map.entry_point_offset(), Some(0x410));
    }

    #[test]
    fn test_serialize() {
        let map = sample();
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("\".text\""));
        let back: MemoryMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.records(), map.records());
        assert_eq!(back.address_to_offset(0x40_2000), Some(0x600));
    }
}
