//! Signature interpreter.
//!
//! Records are immutable; all positional side effects live in [`EvalState`],
//! which is threaded through each step explicitly.

use super::{Signature, SignatureOp, SignatureRecord};
use crate::io::Device;
use crate::memory_map::MemoryMap;
use memchr::memmem;

/// Mutable evaluation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalState {
    /// Current file offset.
    pub cursor: u64,
    /// Base address set by an address or fix-up record.
    pub base: Option<u64>,
    /// Last relative target computed by a relative record.
    pub captured: Option<u64>,
}

fn masked_eq(data: &[u8], bytes: &[u8], mask: &[bool]) -> bool {
    data.len() >= bytes.len()
        && bytes
            .iter()
            .zip(mask)
            .zip(data)
            .all(|((&b, &significant), &d)| !significant || b == d)
}

fn masked_find(haystack: &[u8], bytes: &[u8], mask: &[bool]) -> Option<usize> {
    if mask.iter().all(|&m| m) {
        return memmem::find(haystack, bytes);
    }
    if haystack.len() < bytes.len() {
        return None;
    }
    (0..=haystack.len() - bytes.len()).find(|&i| masked_eq(&haystack[i..], bytes, mask))
}

/// Target of an x86-style relative field at `cursor`: the address of the
/// byte after the field plus the signed field value.
fn relative_target(
    device: &mut Device<'_>,
    map: &MemoryMap,
    cursor: u64,
    width: u8,
) -> Option<u64> {
    let field_address = map.offset_to_address(cursor)?;
    let delta = device.read_signed(cursor, width, map.endianness)?;
    if !device.is_offset_and_size_valid(cursor, u64::from(width)) {
        return None;
    }
    let next = i128::from(field_address) + i128::from(width);
    u64::try_from(next + i128::from(delta)).ok()
}

fn expected_base(record: &SignatureRecord, state: &EvalState) -> Option<u64> {
    record.base_address.or(state.base)
}

/// Execute one record, returning the next state or `None` on mismatch.
fn step(
    device: &mut Device<'_>,
    map: &MemoryMap,
    record: &SignatureRecord,
    mut state: EvalState,
) -> Option<EvalState> {
    match record.op {
        SignatureOp::CompareBytes => {
            let data = device.read_bytes(state.cursor, record.bytes.len());
            if !masked_eq(&data, &record.bytes, &record.mask) {
                return None;
            }
            state.cursor += record.bytes.len() as u64;
        }
        SignatureOp::FindBytes => {
            let window = usize::try_from(record.find_delta).ok()?;
            let span = window.checked_add(record.bytes.len())? - 1;
            let data = device.read_bytes(state.cursor, span);
            let found = masked_find(&data, &record.bytes, &record.mask)?;
            state.cursor += (found + record.bytes.len()) as u64;
        }
        SignatureOp::RelOffset => {
            let target = relative_target(device, map, state.cursor, record.width)?;
            state.cursor = map.address_to_offset(target)?;
            state.captured = Some(target);
        }
        SignatureOp::RelOffsetFix => {
            let target = relative_target(device, map, state.cursor, record.width)?;
            match expected_base(record, &state) {
                Some(base) if base != target => return None,
                Some(_) => {}
                None => state.base = Some(target),
            }
            state.captured = Some(target);
            state.cursor += u64::from(record.width);
        }
        SignatureOp::Address => {
            if !device.is_offset_and_size_valid(state.cursor, u64::from(record.width)) {
                return None;
            }
            let value = device.read_value(state.cursor, record.width, map.endianness)?;
            match expected_base(record, &state) {
                Some(base) if base != value => return None,
                Some(_) => {}
                None => state.base = Some(value),
            }
            state.cursor += u64::from(record.width);
        }
    }
    Some(state)
}

/// Run every record of `signature` starting at `offset`.
///
/// Returns the final state when all records succeed.
pub(crate) fn run(
    signature: &Signature,
    device: &mut Device<'_>,
    map: &MemoryMap,
    offset: u64,
) -> Option<EvalState> {
    let start = EvalState {
        cursor: offset,
        ..EvalState::default()
    };
    signature
        .records
        .iter()
        .try_fold(start, |state, record| step(device, map, record, state))
}
