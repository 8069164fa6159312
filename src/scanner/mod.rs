//! Multi-region scanner.
//!
//! Two drivers share the [`MatchRecord`] output type:
//!
//! - [`StringScanner`] runs the ANSI, UTF-8 and UTF-16 classifiers in one
//!   left-to-right pass and yields matches lazily through [`MultiSearch`].
//! - [`scan_signature`] / [`find_signature`] locate a compiled signature
//!   across a range.
//!
//! Both poll the [`ProgressToken`] stop flag at every candidate boundary and
//! end early with the matches produced so far.

mod strings;

pub use strings::{MultiSearch, ScanCursor, StringScanner};

use crate::error::Result;
use crate::io::Device;
use crate::memory_map::MemoryMap;
use crate::progress::ProgressToken;
use crate::signature::SignatureSet;
use memchr::memmem;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default read chunk for scans.
pub const DEFAULT_CHUNK_SIZE: usize = 0x1_0000;

/// Kind of a scan match.
///
/// The declaration order is the tie-break for matches at equal offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Single-byte string.
    Ansi,
    /// UTF-8 string with at least one multi-byte character.
    Utf8,
    /// UTF-16LE string.
    Unicode,
    /// Signature occurrence.
    Signature,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchKind::Ansi => "A",
            MatchKind::Utf8 => "U8",
            MatchKind::Unicode => "U",
            MatchKind::Signature => "S",
        };
        write!(f, "{s}")
    }
}

/// A discovered string or signature occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// File offset of the first byte.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    /// Match kind.
    pub kind: MatchKind,
    /// Decoded text; empty for signatures.
    pub text: String,
    /// Caller-supplied label.
    pub info: String,
}

bitflags::bitflags! {
    /// String encodings a scan looks for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Encodings: u8 {
        /// Single-byte text.
        const ANSI = 0b001;
        /// UTF-8 text.
        const UTF8 = 0b010;
        /// UTF-16LE text.
        const UNICODE = 0b100;
    }
}

/// How single-byte text outside ASCII is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodePage {
    /// Printable ASCII only.
    #[default]
    Ascii,
    /// ASCII plus the printable Latin-1 range `0xA0..=0xFF`.
    Latin1,
}

impl CodePage {
    /// Whether `unit` is a printable character in this code page.
    pub fn is_printable(self, unit: u16) -> bool {
        match unit {
            0x09 | 0x20..=0x7E => true,
            0xA0..=0xFF => self == CodePage::Latin1,
            _ => false,
        }
    }
}

/// String scan configuration.
#[derive(Debug, Clone)]
pub struct StringScanOptions {
    /// Stop after this many matches; 0 is unlimited.
    pub limit: usize,
    /// Minimum length in characters.
    pub min_length: usize,
    /// Maximum length in characters; longer runs are split.
    pub max_length: usize,
    /// Enabled classifiers.
    pub encodings: Encodings,
    /// Require a NUL terminator right after the string.
    pub c_strings_only: bool,
    /// Keep only texts matching this expression.
    pub regex_filter: Option<Regex>,
    /// Code page for single-byte text.
    pub code_page: CodePage,
    /// Keep only texts that look like links.
    pub links_only: bool,
    /// Bytes read per I/O call.
    pub chunk_size: usize,
}

impl Default for StringScanOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl StringScanOptions {
    /// ANSI and Unicode strings of at least 5 characters.
    pub fn new() -> Self {
        Self {
            limit: 0,
            min_length: 5,
            max_length: 1024,
            encodings: Encodings::ANSI | Encodings::UNICODE,
            c_strings_only: false,
            regex_filter: None,
            code_page: CodePage::Ascii,
            links_only: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Every encoding enabled.
    pub fn all() -> Self {
        Self {
            encodings: Encodings::all(),
            ..Self::new()
        }
    }

    /// Set the match limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the length bounds. `max_length` is raised to `min_length` if lower.
    pub fn with_lengths(mut self, min_length: usize, max_length: usize) -> Self {
        self.min_length = min_length.max(1);
        self.max_length = max_length.max(self.min_length);
        self
    }

    /// Set the enabled encodings.
    pub fn with_encodings(mut self, encodings: Encodings) -> Self {
        self.encodings = encodings;
        self
    }

    /// Require NUL-terminated strings.
    pub fn with_c_strings_only(mut self, enabled: bool) -> Self {
        self.c_strings_only = enabled;
        self
    }

    /// Keep only texts matching `pattern`.
    pub fn with_regex_filter(mut self, pattern: &str) -> Result<Self> {
        self.regex_filter = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Set the code page.
    pub fn with_code_page(mut self, code_page: CodePage) -> Self {
        self.code_page = code_page;
        self
    }

    /// Keep only link-like texts.
    pub fn with_links_only(mut self, enabled: bool) -> Self {
        self.links_only = enabled;
        self
    }

    /// Set the read chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub(crate) fn accepts_text(&self, text: &str) -> bool {
        if self.links_only && !is_link(text) {
            return false;
        }
        self.regex_filter
            .as_ref()
            .map_or(true, |re| re.is_match(text))
    }
}

/// Whether `text` contains something that looks like a URL.
pub fn is_link(text: &str) -> bool {
    const MARKERS: [&str; 4] = ["http://", "https://", "ftp://", "www."];
    let lower = text.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

fn candidate_offsets(chunk: &[u8], anchors: &[memmem::Finder<'_>], limit: usize) -> Vec<usize> {
    let mut hits: Vec<usize> = anchors
        .iter()
        .flat_map(|finder| finder.find_iter(chunk))
        .filter(|&i| i < limit)
        .collect();
    hits.sort_unstable();
    hits.dedup();
    hits
}

/// Find every occurrence of `signature` starting in `[offset, offset + size)`.
///
/// `size = None` scans to the end, `limit = 0` is unlimited. Each match is a
/// [`MatchKind::Signature`] record spanning the bytes the signature consumed,
/// labelled with `info`. Occurrences may overlap.
#[allow(clippy::too_many_arguments)]
pub fn scan_signature(
    device: &mut Device<'_>,
    map: &MemoryMap,
    signature: &SignatureSet,
    offset: u64,
    size: Option<u64>,
    info: &str,
    limit: usize,
    token: Option<&ProgressToken>,
) -> Vec<MatchRecord> {
    let mut found = Vec::new();
    if signature.is_never() {
        return found;
    }
    let (start, len) = device.clamp_range(offset, size);
    let end = start + len;
    let slot = token.map(|t| t.acquire(len));
    if let Some(slot) = &slot {
        slot.set_status("signature");
    }
    let stopped = || token.map_or(false, ProgressToken::is_stopped);

    let anchored = signature
        .alternatives()
        .iter()
        .all(|sig| !sig.anchor().is_empty());
    let anchors: Vec<memmem::Finder<'_>> = if anchored {
        signature
            .alternatives()
            .iter()
            .map(|sig| memmem::Finder::new(sig.anchor()))
            .collect()
    } else {
        Vec::new()
    };
    let overlap = anchors.iter().map(|f| f.needle().len()).max().unwrap_or(1) - 1;

    let mut pos = start;
    while pos < end {
        if stopped() {
            tracing::debug!(offset = pos, "signature scan cancelled");
            break;
        }
        let step = DEFAULT_CHUNK_SIZE.min(usize::try_from(end - pos).unwrap_or(usize::MAX));
        let candidates: Vec<u64> = if anchored {
            let chunk = device.read_bytes(pos, step + overlap);
            candidate_offsets(&chunk, &anchors, step)
                .into_iter()
                .map(|i| pos + i as u64)
                .collect()
        } else {
            (pos..pos + step as u64).collect()
        };

        for candidate in candidates {
            if stopped() {
                break;
            }
            if let Some(state) = signature.evaluate(device, map, candidate) {
                found.push(MatchRecord {
                    offset: candidate,
                    size: state.cursor.saturating_sub(candidate),
                    kind: MatchKind::Signature,
                    text: String::new(),
                    info: info.to_string(),
                });
                if limit != 0 && found.len() >= limit {
                    return found;
                }
            }
        }
        pos += step as u64;
        if let Some(slot) = &slot {
            slot.set_current(pos - start);
        }
    }
    found
}

/// First offset in `[offset, offset + size)` where `signature` matches.
pub fn find_signature(
    device: &mut Device<'_>,
    map: &MemoryMap,
    signature: &SignatureSet,
    offset: u64,
    size: Option<u64>,
    token: Option<&ProgressToken>,
) -> Option<u64> {
    scan_signature(device, map, signature, offset, size, "", 1, token)
        .first()
        .map(|m| m.offset)
}

/// Whether `pattern` occurs anywhere in `[offset, offset + size)`.
///
/// Malformed text never matches.
pub fn is_signature_present(
    device: &mut Device<'_>,
    map: &MemoryMap,
    offset: u64,
    size: Option<u64>,
    pattern: &str,
    token: Option<&ProgressToken>,
) -> bool {
    let signature = SignatureSet::parse_lenient(pattern);
    find_signature(device, map, &signature, offset, size, token).is_some()
}

/// Whether `pattern` occurs in the file bytes of any record belonging to
/// load section `load_section`.
pub fn is_signature_in_load_segment_present(
    device: &mut Device<'_>,
    map: &MemoryMap,
    load_section: u32,
    pattern: &str,
    token: Option<&ProgressToken>,
) -> bool {
    let signature = SignatureSet::parse_lenient(pattern);
    map.records()
        .iter()
        .filter(|r| r.load_section == Some(load_section))
        .filter_map(|r| Some((r.file_offset?, r.size)))
        .any(|(offset, size)| {
            find_signature(device, map, &signature, offset, Some(size), token).is_some()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ByteSource;

    #[test]
    fn test_is_link() {
        assert!(is_link("see https://example.com"));
        assert!(is_link("WWW.EXAMPLE.ORG"));
        assert!(!is_link("kernel32.dll"));
    }

    #[test]
    fn test_options_presets() {
        let opts = StringScanOptions::new();
        assert!(opts.encodings.contains(Encodings::ANSI));
        assert!(!opts.encodings.contains(Encodings::UTF8));
        assert_eq!(StringScanOptions::all().encodings, Encodings::all());
        let opts = StringScanOptions::new().with_lengths(8, 4);
        assert_eq!((opts.min_length, opts.max_length), (8, 8));
        assert!(StringScanOptions::new().with_regex_filter("(").is_err());
    }

    #[test]
    fn test_code_page() {
        assert!(CodePage::Ascii.is_printable(u16::from(b'~')));
        assert!(!CodePage::Ascii.is_printable(0xE9));
        assert!(CodePage::Latin1.is_printable(0xE9));
        assert!(!CodePage::Latin1.is_printable(0x85));
    }

    #[test]
    fn test_scan_signature_all_occurrences() {
        let mut data = vec![0u8; 3 * DEFAULT_CHUNK_SIZE];
        let spots = [10usize, DEFAULT_CHUNK_SIZE - 1, 2 * DEFAULT_CHUNK_SIZE + 7];
        for &s in &spots {
            data[s..s + 3].copy_from_slice(&[0xDE, 0xAD, 0x01]);
        }
        let map = MemoryMap::flat(data.len() as u64);
        let mut dev = Device::new(&mut data);
        let sig = SignatureSet::compile("DE AD ..").unwrap();

        let found = scan_signature(&mut dev, &map, &sig, 0, None, "dead", 0, None);
        let offsets: Vec<u64> = found.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, spots.iter().map(|&s| s as u64).collect::<Vec<_>>());
        assert!(found.iter().all(|m| m.size == 3 && m.info == "dead"));

        let limited = scan_signature(&mut dev, &map, &sig, 0, None, "", 2, None);
        assert_eq!(limited.len(), 2);
        assert_eq!(find_signature(&mut dev, &map, &sig, 11, None, None), Some(spots[1] as u64));
    }

    #[test]
    fn test_scan_signature_unanchored() {
        let mut data = b"xxABxxAB".to_vec();
        let map = MemoryMap::flat(data.len() as u64);
        let mut dev = Device::new(&mut data);
        let sig = SignatureSet::compile(".. 'B'").unwrap();
        let found = scan_signature(&mut dev, &map, &sig, 0, None, "", 0, None);
        assert_eq!(found.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![2, 6]);
    }

    /// Trips the stop flag once a given number of reads has been served.
    struct StopAfterReads<'t> {
        data: Vec<u8>,
        token: &'t ProgressToken,
        reads_left: usize,
    }

    impl ByteSource for StopAfterReads<'_> {
        fn size(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads_left = self.reads_left.saturating_sub(1);
            if self.reads_left == 0 {
                self.token.stop();
            }
            self.data.read_at(offset, buf)
        }
    }

    #[test]
    fn test_scan_signature_stopped_mid_range() {
        let mut data = vec![0u8; 2 * DEFAULT_CHUNK_SIZE];
        for s in (0..data.len() - 4).step_by(0x100) {
            data[s..s + 3].copy_from_slice(&[0xDE, 0xAD, 0x01]);
        }
        let map = MemoryMap::flat(data.len() as u64);
        let sig = SignatureSet::compile("DE AD ..").unwrap();
        let mut copy = data.clone();
        let full = scan_signature(&mut Device::new(&mut copy), &map, &sig, 0, None, "", 0, None);
        assert_eq!(full.len(), 2 * DEFAULT_CHUNK_SIZE / 0x100);

        let token = ProgressToken::new();
        let mut src = StopAfterReads {
            data,
            token: &token,
            reads_left: 16,
        };
        let mut dev = Device::new(&mut src);
        let partial = scan_signature(&mut dev, &map, &sig, 0, None, "", 0, Some(&token));
        assert!(token.is_stopped());
        assert!(!partial.is_empty());
        assert!(partial.len() < full.len());
        assert_eq!(&partial[..], &full[..partial.len()]);
    }

    #[test]
    fn test_signature_present_in_range_and_load_section() {
        use crate::memory_map::{MemoryRecord, RecordKind};
        use crate::types::FileType;

        let mut data = vec![0u8; 0x300];
        data[0x250..0x254].copy_from_slice(b"UPX!");
        let mut map = MemoryMap::new(FileType::Pe32);
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0x100, Some(0x1000), 0x100)
                .with_load_section(0),
        );
        map.push_record(
            MemoryRecord::physical(RecordKind::LoadSegment, 0x200, Some(0x2000), 0x100)
                .with_load_section(1),
        );
        map.push_record(
            MemoryRecord::virtual_region(RecordKind::LoadSegment, 0x2100, 0x1000)
                .with_load_section(1),
        );
        let mut dev = Device::new(&mut data);

        assert!(is_signature_present(&mut dev, &map, 0, None, "'UPX!'", None));
        assert!(!is_signature_present(&mut dev, &map, 0, Some(0x250), "'UPX!'", None));
        assert!(!is_signature_present(&mut dev, &map, 0, None, "'UPX", None));
        assert!(is_signature_in_load_segment_present(&mut dev, &map, 1, "'UPX!'", None));
        assert!(!is_signature_in_load_segment_present(&mut dev, &map, 0, "'UPX!'", None));
        assert!(!is_signature_in_load_segment_present(&mut dev, &map, 7, "00", None));
    }

    #[test]
    fn test_scan_signature_stopped() {
        let mut data = b"ABABAB".to_vec();
        let map = MemoryMap::flat(data.len() as u64);
        let mut dev = Device::new(&mut data);
        let token = ProgressToken::new();
        token.stop();
        let sig = SignatureSet::compile("'AB'").unwrap();
        assert!(scan_signature(&mut dev, &map, &sig, 0, None, "", 0, Some(&token)).is_empty());
    }
}
