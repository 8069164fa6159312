//! Signature pattern engine.
//!
//! A signature is compiled once from text into a [`SignatureSet`]: one or
//! more alternative [`Signature`]s, each an ordered list of immutable
//! [`SignatureRecord`] operations. Evaluation at an offset runs the records
//! in order against a [`Device`] and a [`MemoryMap`]; a mismatch is a plain
//! `false`, never an error. Alternatives are tried in order at the same
//! offset and the first success wins.
//!
//! ```rust
//! use binprobe::{Device, MemoryMap, SignatureSet};
//!
//! let data = b"MZ\x90\x00";
//! let mut src: &[u8] = data;
//! let mut device = Device::new(&mut src);
//! let map = MemoryMap::flat(device.size());
//!
//! let sig = SignatureSet::compile("'ZM' | 'MZ' 90").unwrap();
//! assert!(sig.matches_at(&mut device, &map, 0));
//! ```

mod compiler;
mod eval;

pub use eval::EvalState;

use crate::error::Result;
use crate::io::Device;
use crate::memory_map::MemoryMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation performed by one signature record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureOp {
    /// Mask-aware comparison at the cursor.
    CompareBytes,
    /// Forward search within `find_delta` bytes of the cursor.
    FindBytes,
    /// Relative offset checked against, or captured as, the base address.
    RelOffsetFix,
    /// Relative offset followed to its target.
    RelOffset,
    /// Absolute address checked against, or captured as, the base address.
    Address,
}

/// One compiled signature operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Operation kind.
    pub op: SignatureOp,
    /// Base address declared before this record.
    pub base_address: Option<u64>,
    /// Byte payload for compare/find.
    pub bytes: Vec<u8>,
    /// `true` for significant payload bytes, `false` for wildcards.
    pub mask: Vec<bool>,
    /// Field width for relative/address records.
    pub width: u8,
    /// Search window for find records.
    pub find_delta: u64,
}

/// One alternative: records that must all succeed in sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    records: Vec<SignatureRecord>,
}

impl Signature {
    /// Compiled records, in execution order.
    pub fn records(&self) -> &[SignatureRecord] {
        &self.records
    }

    /// Leading significant bytes a match must start with.
    ///
    /// Used to find candidate offsets quickly; empty when the signature does
    /// not start with a literal byte.
    pub fn anchor(&self) -> &[u8] {
        match self.records.first() {
            Some(r) if r.op == SignatureOp::CompareBytes => {
                let n = r.mask.iter().take_while(|&&m| m).count();
                &r.bytes[..n]
            }
            _ => &[],
        }
    }

    /// Evaluate at `offset`, returning the final state on success.
    pub fn evaluate(&self, device: &mut Device<'_>, map: &MemoryMap, offset: u64) -> Option<EvalState> {
        eval::run(self, device, map, offset)
    }
}

fn write_run(f: &mut fmt::Formatter<'_>, record: &SignatureRecord) -> fmt::Result {
    let mut first = true;
    for (byte, significant) in record.bytes.iter().zip(&record.mask) {
        if !first {
            write!(f, " ")?;
        }
        first = false;
        if *significant {
            write!(f, "{byte:02X}")?;
        } else {
            write!(f, "..")?;
        }
    }
    Ok(())
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut base = None;
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if record.base_address != base {
                if let Some(address) = record.base_address {
                    write!(f, "[base:{address:#x}] ")?;
                }
                base = record.base_address;
            }
            match record.op {
                SignatureOp::CompareBytes => write_run(f, record)?,
                SignatureOp::FindBytes => {
                    write!(f, "[find:{}] ", record.find_delta)?;
                    write_run(f, record)?;
                }
                SignatureOp::RelOffset => write!(f, "[rel:{}]", record.width)?,
                SignatureOp::RelOffsetFix => write!(f, "[fix:{}]", record.width)?,
                SignatureOp::Address => write!(f, "[addr:{}]", record.width)?,
            }
        }
        Ok(())
    }
}

/// A compiled signature with its alternatives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSet {
    alternatives: Vec<Signature>,
}

impl SignatureSet {
    /// Compile signature text.
    pub fn compile(text: &str) -> Result<Self> {
        let alternatives = compiler::compile(text)?;
        tracing::trace!(text, alternatives = alternatives.len(), "compiled signature");
        Ok(Self { alternatives })
    }

    /// Compile, treating malformed text as a set that never matches.
    pub fn parse_lenient(text: &str) -> Self {
        Self::compile(text).unwrap_or_else(|err| {
            tracing::warn!(text, %err, "invalid signature, it will never match");
            Self::never()
        })
    }

    /// A set without alternatives; it matches nothing.
    pub fn never() -> Self {
        Self {
            alternatives: Vec::new(),
        }
    }

    /// Alternatives in the order they are tried.
    pub fn alternatives(&self) -> &[Signature] {
        &self.alternatives
    }

    /// Whether the set can never match.
    pub fn is_never(&self) -> bool {
        self.alternatives.is_empty()
    }

    /// Evaluate each alternative at `offset`; the first success wins.
    pub fn evaluate(&self, device: &mut Device<'_>, map: &MemoryMap, offset: u64) -> Option<EvalState> {
        self.alternatives
            .iter()
            .find_map(|sig| sig.evaluate(device, map, offset))
    }

    /// Whether any alternative matches at `offset`.
    pub fn matches_at(&self, device: &mut Device<'_>, map: &MemoryMap, offset: u64) -> bool {
        self.evaluate(device, map, offset).is_some()
    }
}

impl fmt::Display for SignatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, sig) in self.alternatives.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{sig}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for SignatureSet {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::compile(s)
    }
}

/// Match `pattern` at `offset`, addresses being file offsets.
pub fn compare_signature(device: &mut Device<'_>, pattern: &str, offset: u64) -> bool {
    let map = MemoryMap::flat(device.size());
    compare_signature_with_map(device, &map, pattern, offset)
}

/// Match `pattern` at `offset` using `map` for address-relative records.
pub fn compare_signature_with_map(
    device: &mut Device<'_>,
    map: &MemoryMap,
    pattern: &str,
    offset: u64,
) -> bool {
    SignatureSet::parse_lenient(pattern).matches_at(device, map, offset)
}

/// Match `pattern` at the file offset of `address`; unmapped is `false`.
pub fn compare_signature_on_address(
    device: &mut Device<'_>,
    map: &MemoryMap,
    pattern: &str,
    address: u64,
) -> bool {
    match map.address_to_offset(address) {
        Some(offset) => compare_signature_with_map(device, map, pattern, offset),
        None => false,
    }
}

/// Match `pattern` at `delta` bytes past the entry point.
pub fn compare_entry_point(
    device: &mut Device<'_>,
    map: &MemoryMap,
    pattern: &str,
    delta: u64,
) -> bool {
    map.entry_point_offset()
        .and_then(|ep| ep.checked_add(delta))
        .map_or(false, |offset| compare_signature_with_map(device, map, pattern, offset))
}

/// Match `pattern` at `delta` bytes into the overlay; `false` without one.
pub fn compare_overlay(
    device: &mut Device<'_>,
    map: &MemoryMap,
    pattern: &str,
    delta: u64,
) -> bool {
    map.overlay()
        .filter(|r| r.size > delta)
        .and_then(|r| r.file_offset?.checked_add(delta))
        .map_or(false, |offset| compare_signature_with_map(device, map, pattern, offset))
}

/// Signature text for the bytes at `[offset, offset + size)`.
///
/// The result is upper-case hex without separators and compiles back to a
/// literal signature. Bytes past the end are left out.
pub fn get_signature(device: &mut Device<'_>, offset: u64, size: usize) -> String {
    hex::encode_upper(device.read_bytes(offset, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::{MemoryRecord, RecordKind};
    use crate::types::FileType;

    fn device(data: &[u8]) -> (Vec<u8>, MemoryMap) {
        (data.to_vec(), MemoryMap::flat(data.len() as u64))
    }

    #[test]
    fn test_literal_prefix_and_single_byte_change() {
        let data: Vec<u8> = (0u8..32).collect();
        let pattern: String = data[..16]
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");

        let mut src: &[u8] = &data;
        let mut dev = Device::new(&mut src);
        assert!(compare_signature(&mut dev, &pattern, 0));

        for i in 0..16 {
            let mut altered = data.clone();
            altered[i] ^= 0xFF;
            let mut src: &[u8] = &altered;
            let mut dev = Device::new(&mut src);
            assert!(!compare_signature(&mut dev, &pattern, 0), "byte {i}");
        }
    }

    #[test]
    fn test_find_window_edges() {
        const W: usize = 8;
        let make = |pos: usize| {
            let mut data = vec![0u8; 32];
            data[pos..pos + 2].copy_from_slice(&[0xC3, 0xCC]);
            data
        };
        let sig = SignatureSet::compile(&format!("[find:{W}] C3 CC")).unwrap();

        let (mut data, map) = device(&make(W - 1));
        let mut dev = Device::new(&mut data);
        let state = sig.evaluate(&mut dev, &map, 0).unwrap();
        assert_eq!(state.cursor, (W + 1) as u64);

        let (mut data, map) = device(&make(W + 1));
        let mut dev = Device::new(&mut data);
        assert!(!sig.matches_at(&mut dev, &map, 0));

        let (mut data, map) = device(&make(W));
        let mut dev = Device::new(&mut data);
        assert!(!sig.matches_at(&mut dev, &map, 0));
    }

    #[test]
    fn test_relative_call_followed() {
        // E8 rel32 at 0x10 -> target 0x10 + 5 + 0x0B = 0x20, which starts with 55 8B EC.
        let mut data = vec![0u8; 0x30];
        data[0x10] = 0xE8;
        data[0x11..0x15].copy_from_slice(&0x0Bi32.to_le_bytes());
        data[0x20..0x23].copy_from_slice(&[0x55, 0x8B, 0xEC]);
        let (mut data, map) = device(&data);
        let mut dev = Device::new(&mut data);

        let sig = SignatureSet::compile("E8 $$$$ 55 8B EC").unwrap();
        let state = sig.evaluate(&mut dev, &map, 0x10).unwrap();
        assert_eq!(state.cursor, 0x23);
        assert_eq!(state.captured, Some(0x20));
        assert!(!compare_signature(&mut dev, "E8 $$$$ 90", 0x10));
    }

    #[test]
    fn test_negative_relative_short_jump() {
        let mut data = vec![0x90u8; 0x10];
        data[8] = 0xEB;
        data[9] = 0xF6; // -10 -> 10 - 10 = 0
        data[0] = 0xCC;
        let mut src: &[u8] = &data;
        let mut dev = Device::new(&mut src);
        assert!(compare_signature(&mut dev, "EB $$ CC", 8));
    }

    #[test]
    fn test_fix_and_address_against_base() {
        let mut data = vec![0u8; 0x20];
        // Absolute 0x00401000 at 0, rel32 at 4 pointing to 0x401000.
        data[0..4].copy_from_slice(&0x0040_1000u32.to_le_bytes());
        let mut map = MemoryMap::new(FileType::Pe32);
        map.module_address = 0x40_0000;
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0, Some(0x40_1000), 0x20),
        );
        // Field at 0x401004, next = 0x401008, delta = -8.
        data[4..8].copy_from_slice(&(-8i32).to_le_bytes());
        let mut dev_data = data.clone();
        let mut dev = Device::new(&mut dev_data);

        assert!(compare_signature_with_map(&mut dev, &map, "[base:0x401000] #### [fix:4]", 0));
        assert!(!compare_signature_with_map(&mut dev, &map, "[base:0x402000] ####", 0));
        // Without a declared base the address is captured and the fix-up is
        // checked against it.
        let state = SignatureSet::compile("#### [fix:4]")
            .unwrap()
            .evaluate(&mut dev, &map, 0)
            .unwrap();
        assert_eq!(state.base, Some(0x40_1000));
        assert_eq!(state.cursor, 8);
    }

    #[test]
    fn test_alternation_same_offset() {
        let mut src: &[u8] = b"..ZM..";
        let mut dev = Device::new(&mut src);
        assert!(compare_signature(&mut dev, "'MZ' | 'ZM'", 2));
        assert!(!compare_signature(&mut dev, "'MZ' | 'ZM'", 1));
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let mut src: &[u8] = b"MZ";
        let mut dev = Device::new(&mut src);
        assert!(!compare_signature(&mut dev, "'MZ", 0));
        assert!(SignatureSet::parse_lenient("zz").is_never());
    }

    #[test]
    fn test_on_address_and_entry_point() {
        let mut data = vec![0u8; 0x40];
        data[0x30..0x33].copy_from_slice(&[0x55, 0x89, 0xE5]);
        let mut map = MemoryMap::new(FileType::Elf32);
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0, Some(0x0804_8000), 0x40),
        );
        map.entry_point_address = Some(0x0804_8030);
        let mut dev = Device::new(&mut data);

        assert!(compare_signature_on_address(&mut dev, &map, "55 89 E5", 0x0804_8030));
        assert!(!compare_signature_on_address(&mut dev, &map, "55", 0x0900_0000));
        assert!(compare_entry_point(&mut dev, &map, "55 89 E5", 0));
        assert!(compare_entry_point(&mut dev, &map, "E5", 2));
    }

    #[test]
    fn test_compare_overlay() {
        let mut data = vec![0u8; 0x20];
        data[0x18..0x1C].copy_from_slice(b"PK\x03\x04");
        let mut map = MemoryMap::new(FileType::MsDos);
        map.push_record(MemoryRecord::physical(RecordKind::LoadSegment, 0, Some(0), 0x10));
        let mut dev = Device::new(&mut data);
        assert!(!compare_overlay(&mut dev, &map, "'PK'", 0));

        map.push_record(MemoryRecord::physical(RecordKind::Overlay, 0x10, None, 0x10));
        assert!(compare_overlay(&mut dev, &map, "'PK' 03 04", 8));
        assert!(!compare_overlay(&mut dev, &map, "'PK'", 0));
        assert!(!compare_overlay(&mut dev, &map, "..", 0x10));
        assert!(!compare_overlay(&mut dev, &map, "..", u64::MAX));
    }

    #[test]
    fn test_get_signature_compiles_back() {
        let mut src: &[u8] = &[0x55, 0x8B, 0xEC, 0x0A];
        let mut dev = Device::new(&mut src);
        let text = get_signature(&mut dev, 0, 3);
        assert_eq!(text, "558BEC");
        assert!(compare_signature(&mut dev, &text, 0));
        assert!(!compare_signature(&mut dev, &text, 1));
        assert_eq!(get_signature(&mut dev, 2, 8), "EC0A");
        assert_eq!(get_signature(&mut dev, 4, 8), "");
    }

    #[test]
    fn test_reserialize_equivalent() {
        let texts = [
            "4D 5A .. .. 'PE'",
            "E8 $$$$ [base:0x1000] #### [fix:4] [find:32] 'x' ?? 00",
            "'MZ' | 'ZM' 90",
        ];
        let mut data = vec![0u8; 0x100];
        data[..4].copy_from_slice(b"MZ\x01\x02");
        let map = MemoryMap::flat(data.len() as u64);
        for text in texts {
            let first = SignatureSet::compile(text).unwrap();
            let rendered = first.to_string();
            let second = SignatureSet::compile(&rendered).unwrap();
            assert_eq!(first, second, "{text} -> {rendered}");
            let mut dev = Device::new(&mut data);
            for offset in 0..8 {
                assert_eq!(
                    first.matches_at(&mut dev, &map, offset),
                    second.matches_at(&mut dev, &map, offset)
                );
            }
        }
    }

    #[test]
    fn test_anchor() {
        let sig = SignatureSet::compile("4D 5A .. 00").unwrap();
        assert_eq!(sig.alternatives()[0].anchor(), b"MZ");
        let sig = SignatureSet::compile("[find:4] 4D").unwrap();
        assert!(sig.alternatives()[0].anchor().is_empty());
    }
}
