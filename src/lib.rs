//! binprobe - Format-Agnostic Binary Introspection
//!
//! This library provides the building blocks binary analysis tools share:
//! bounded access to byte streams, memory maps that translate between file
//! offsets and virtual addresses, a signature pattern language, a
//! multi-encoding string scanner and cooperative cancellation.
//!
//! # Features
//!
//! - **Bounded I/O**: Short reads instead of faults, endian-explicit scalars
//! - **Memory Maps**: Offset/address/relative-address translation per format
//! - **Signatures**: Hex/wildcard/text patterns with relative jumps and searches
//! - **String Scanning**: ANSI, UTF-8 and UTF-16 in one pass, resumable
//! - **Format Detection**: ELF, PE, Mach-O, MS-DOS/NE/LE/LX, Amiga Hunk, and more
//! - **Digests and Entropy**: MD5, SHA-1, SHA-2 and Shannon entropy
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use binprobe::{Device, FormatRegistry, StringScanOptions, StringScanner};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut file = std::fs::File::open("path/to/binary")?;
//!     let mut device = Device::new(&mut file);
//!
//!     let registry = FormatRegistry::default();
//!     println!("Type: {}", registry.preferred_type(&mut device));
//!
//!     let map = registry.memory_map(&mut device);
//!     for record in map.records() {
//!         println!("{record}");
//!     }
//!
//!     let scanner = StringScanner::new(StringScanOptions::new());
//!     for m in scanner.scan(&mut device, 0, None, None) {
//!         println!("{:#x} {} {}", m.offset, m.kind, m.text);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

pub mod analysis;
pub mod error;
pub mod formats;
pub mod formatter;
pub mod io;
pub mod memory_map;
pub mod progress;
pub mod scanner;
pub mod signature;
pub mod types;

pub use analysis::{entropy, hash, hash_regions, is_packed, HashKind};
pub use error::{EngineError, Result};
pub use formats::{FormatParser, FormatRegistry};
pub use io::{ByteSource, Device, SharedSource, StreamSource};
pub use memory_map::{MemoryMap, MemoryRecord, RecordKind};
pub use progress::{ProgressSlot, ProgressToken};
pub use scanner::{
    find_signature, is_signature_in_load_segment_present, is_signature_present, scan_signature,
    Encodings, MatchKind, MatchRecord, ScanCursor, StringScanOptions, StringScanner,
};
pub use signature::{
    compare_entry_point, compare_overlay, compare_signature, compare_signature_on_address,
    get_signature, SignatureSet,
};
pub use types::{Endianness, FileType, Mode};

use std::collections::BTreeSet;
use std::path::Path;

/// Every file type the built-in parsers recognize in `device`.
///
/// Extra formats (images, archives, text) are included only on request.
///
/// # Example
///
/// ```rust
/// use binprobe::{detect_types, Device, FileType};
///
/// let mut data: &[u8] = b"\x7FELF\x02\x01\x01";
/// let mut device = Device::new(&mut data);
/// // Too short for an ELF header: only the fallback matches.
/// assert!(detect_types(&mut device, false).contains(&FileType::Binary));
/// ```
pub fn detect_types(device: &mut Device<'_>, include_extra: bool) -> BTreeSet<FileType> {
    FormatRegistry::default().detect_types(device, include_extra)
}

/// The single preferred file type of `device`.
pub fn preferred_type(device: &mut Device<'_>) -> FileType {
    FormatRegistry::default().preferred_type(device)
}

/// Memory map of the preferred file type, falling back to a flat map.
pub fn memory_map(device: &mut Device<'_>) -> MemoryMap {
    FormatRegistry::default().memory_map(device)
}

/// Open a file and build its memory map.
///
/// # Example
///
/// ```rust,no_run
/// let map = binprobe::memory_map_of_file("/bin/ls")?;
/// println!("{} records", map.records().len());
/// # Ok::<(), binprobe::EngineError>(())
/// ```
pub fn memory_map_of_file<P: AsRef<Path>>(path: P) -> Result<MemoryMap> {
    let mut file = std::fs::File::open(path)?;
    let mut device = Device::new(&mut file);
    Ok(memory_map(&mut device))
}

/// Get version information for this library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
