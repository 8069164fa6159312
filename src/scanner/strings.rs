//! Lockstep ANSI / UTF-8 / UTF-16 string classifiers.
//!
//! Every byte of the range is fed once to each enabled classifier. A
//! classifier keeps at most one open run (two for UTF-16, one per byte
//! parity) and hands a candidate over when the run ends. Candidates are
//! buffered until no open run can still produce an earlier match, then
//! released in `(offset, kind)` order, so the output is the same whatever
//! the chunk size.

use super::{Encodings, MatchKind, MatchRecord, StringScanOptions};
use crate::io::Device;
use crate::progress::{ProgressSlot, ProgressToken};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    Nul,
    Other,
    Split,
    End,
}

#[derive(Debug)]
struct Candidate {
    kind: MatchKind,
    offset: u64,
    size: u64,
    chars: usize,
    text: String,
    terminator: Terminator,
}

/// How a run that reached `max_length` ends, decided by the unit after it.
fn full_run_end(unit: u16) -> Terminator {
    if unit == 0 {
        Terminator::Nul
    } else {
        Terminator::Split
    }
}

#[derive(Debug, Default)]
struct AnsiRun {
    start: Option<u64>,
    text: String,
    chars: usize,
    full: bool,
}

impl AnsiRun {
    fn feed(&mut self, pos: u64, byte: u8, opts: &StringScanOptions, out: &mut Vec<Candidate>) -> bool {
        let boundary = self.full && self.emit(full_run_end(u16::from(byte)), out);
        if opts.code_page.is_printable(u16::from(byte)) {
            self.start.get_or_insert(pos);
            self.text.push(char::from(byte));
            self.chars += 1;
            self.full = self.chars >= opts.max_length;
            return boundary;
        }
        let terminator = if byte == 0 {
            Terminator::Nul
        } else {
            Terminator::Other
        };
        self.emit(terminator, out) || boundary
    }

    fn emit(&mut self, terminator: Terminator, out: &mut Vec<Candidate>) -> bool {
        self.full = false;
        let Some(offset) = self.start.take() else {
            return false;
        };
        out.push(Candidate {
            kind: MatchKind::Ansi,
            offset,
            size: self.chars as u64,
            chars: std::mem::take(&mut self.chars),
            text: std::mem::take(&mut self.text),
            terminator,
        });
        true
    }

    fn open_at(&self) -> Option<u64> {
        self.start
    }
}

#[derive(Debug, Default)]
struct Utf8Run {
    start: Option<u64>,
    text: String,
    chars: usize,
    bytes: u64,
    multibyte: bool,
    seq: [u8; 4],
    seq_len: usize,
    seq_need: usize,
    seq_start: u64,
    full: bool,
}

impl Utf8Run {
    fn feed(&mut self, pos: u64, byte: u8, opts: &StringScanOptions, out: &mut Vec<Candidate>) -> bool {
        let mut boundary = self.full && self.emit(full_run_end(u16::from(byte)), out);
        if self.seq_need > 0 {
            if (0x80..=0xBF).contains(&byte) {
                self.seq[self.seq_len] = byte;
                self.seq_len += 1;
                if self.seq_len < self.seq_need {
                    return boundary;
                }
                let len = self.seq_need;
                self.seq_need = 0;
                let decoded = std::str::from_utf8(&self.seq[..len])
                    .ok()
                    .and_then(|s| s.chars().next())
                    .filter(|c| !c.is_control());
                return match decoded {
                    Some(c) => self.push(self.seq_start, c, len, opts, out) || boundary,
                    None => self.emit(Terminator::Other, out) || boundary,
                };
            }
            // Broken sequence: end the run, then treat the byte afresh.
            self.seq_need = 0;
            boundary |= self.emit(Terminator::Other, out);
        }

        let need = match byte {
            0x09 | 0x20..=0x7E => {
                return self.push(pos, char::from(byte), 1, opts, out) || boundary;
            }
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            0 => return self.emit(Terminator::Nul, out) || boundary,
            _ => return self.emit(Terminator::Other, out) || boundary,
        };
        self.seq[0] = byte;
        self.seq_len = 1;
        self.seq_need = need;
        self.seq_start = pos;
        boundary
    }

    fn push(
        &mut self,
        at: u64,
        c: char,
        len: usize,
        opts: &StringScanOptions,
        out: &mut Vec<Candidate>,
    ) -> bool {
        self.start.get_or_insert(at);
        self.text.push(c);
        self.chars += 1;
        self.bytes += len as u64;
        self.multibyte |= len > 1;
        self.full = self.chars >= opts.max_length;
        false
    }

    fn emit(&mut self, terminator: Terminator, out: &mut Vec<Candidate>) -> bool {
        self.full = false;
        let Some(offset) = self.start.take() else {
            return false;
        };
        let text = std::mem::take(&mut self.text);
        let chars = std::mem::take(&mut self.chars);
        let size = std::mem::take(&mut self.bytes);
        // Pure ASCII runs belong to the ANSI classifier.
        if std::mem::take(&mut self.multibyte) {
            out.push(Candidate {
                kind: MatchKind::Utf8,
                offset,
                size,
                chars,
                text,
                terminator,
            });
        }
        true
    }

    fn finish(&mut self, out: &mut Vec<Candidate>) {
        self.seq_need = 0;
        self.emit(Terminator::End, out);
    }

    fn open_at(&self) -> Option<u64> {
        let pending = (self.seq_need > 0).then_some(self.seq_start);
        match (self.start, pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// One UTF-16LE lane: pairs bytes into code units at a fixed parity.
#[derive(Debug, Default)]
struct Utf16Lane {
    skip: bool,
    low: Option<(u64, u8)>,
    start: Option<u64>,
    text: String,
    chars: usize,
    full: bool,
}

impl Utf16Lane {
    fn feed(&mut self, pos: u64, byte: u8, opts: &StringScanOptions, out: &mut Vec<Candidate>) -> bool {
        if self.skip {
            self.skip = false;
            return false;
        }
        let Some((at, lo)) = self.low.take() else {
            self.low = Some((pos, byte));
            return false;
        };
        let unit = u16::from(lo) | u16::from(byte) << 8;
        let boundary = self.full && self.emit(full_run_end(unit), out);
        if opts.code_page.is_printable(unit) {
            self.start.get_or_insert(at);
            self.text.push(char::from(lo));
            self.chars += 1;
            self.full = self.chars >= opts.max_length;
            return boundary;
        }
        let terminator = if unit == 0 {
            Terminator::Nul
        } else {
            Terminator::Other
        };
        self.emit(terminator, out) || boundary
    }

    fn emit(&mut self, terminator: Terminator, out: &mut Vec<Candidate>) -> bool {
        self.full = false;
        let Some(offset) = self.start.take() else {
            return false;
        };
        let chars = std::mem::take(&mut self.chars);
        out.push(Candidate {
            kind: MatchKind::Unicode,
            offset,
            size: chars as u64 * 2,
            chars,
            text: std::mem::take(&mut self.text),
            terminator,
        });
        true
    }

    fn open_at(&self) -> Option<u64> {
        match (self.start, self.low.map(|(p, _)| p)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Where a string scan stopped.
///
/// Hand it to [`StringScanner::resume`] to continue. Matches already
/// yielded before the cursor was taken are not repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Offset the classifiers restart at.
    pub position: u64,
    /// End of the scanned range (exclusive).
    pub end: u64,
    /// Offset and kind of the last match yielded.
    pub last: Option<(u64, MatchKind)>,
}

impl ScanCursor {
    /// Whether nothing is left to scan.
    pub fn is_finished(&self) -> bool {
        self.position >= self.end
    }
}

type PendingKey = (u64, MatchKind, u64);

/// Lazy iterator over the strings in a range.
///
/// Created by [`StringScanner::scan`]. Holds the device borrow for its
/// lifetime and reads one chunk at a time.
pub struct MultiSearch<'d, 'a> {
    device: &'d mut Device<'a>,
    options: StringScanOptions,
    token: Option<&'d ProgressToken>,
    slot: Option<ProgressSlot<'d>>,
    start: u64,
    end: u64,
    pos: u64,
    ansi: Option<AnsiRun>,
    utf8: Option<Utf8Run>,
    lanes: Option<[Utf16Lane; 2]>,
    candidates: Vec<Candidate>,
    // `None` values are filtered-out runs kept only to pin the cursor.
    pending: BTreeMap<PendingKey, Option<MatchRecord>>,
    seq: u64,
    yielded: usize,
    skip_through: Option<(u64, MatchKind)>,
    last: Option<(u64, MatchKind)>,
    input_done: bool,
    cancelled: bool,
    buf: Vec<u8>,
}

impl std::fmt::Debug for MultiSearch<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSearch")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("pos", &self.pos)
            .field("yielded", &self.yielded)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl<'d, 'a> MultiSearch<'d, 'a> {
    fn new(
        device: &'d mut Device<'a>,
        options: StringScanOptions,
        offset: u64,
        size: Option<u64>,
        token: Option<&'d ProgressToken>,
    ) -> Self {
        let (start, len) = device.clamp_range(offset, size);
        let slot = token.map(|t| t.acquire(len));
        if let Some(slot) = &slot {
            slot.set_status("strings");
        }
        let enc = options.encodings;
        tracing::debug!(start, len, encodings = ?enc, "string scan started");
        Self {
            ansi: enc.contains(Encodings::ANSI).then(AnsiRun::default),
            utf8: enc.contains(Encodings::UTF8).then(Utf8Run::default),
            lanes: enc.contains(Encodings::UNICODE).then(|| {
                [
                    Utf16Lane::default(),
                    Utf16Lane {
                        skip: true,
                        ..Utf16Lane::default()
                    },
                ]
            }),
            buf: vec![0u8; options.chunk_size.max(1)],
            device,
            options,
            token,
            slot,
            start,
            end: start + len,
            pos: start,
            candidates: Vec::new(),
            pending: BTreeMap::new(),
            seq: 0,
            yielded: 0,
            skip_through: None,
            last: None,
            input_done: len == 0,
            cancelled: false,
        }
    }

    /// Whether the scan ended because the stop flag was set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Number of matches yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Resume point: every match before it has been yielded.
    pub fn cursor(&self) -> ScanCursor {
        let mut position = if self.input_done && !self.cancelled {
            self.end
        } else {
            self.pos
        };
        let open = [
            self.ansi.as_ref().and_then(AnsiRun::open_at),
            self.utf8.as_ref().and_then(Utf8Run::open_at),
            self.lanes.as_ref().and_then(|l| l[0].open_at()),
            self.lanes.as_ref().and_then(|l| l[1].open_at()),
            self.pending.keys().next().map(|k| k.0),
        ];
        for at in open.into_iter().flatten() {
            position = position.min(at);
        }
        ScanCursor {
            position,
            end: self.end,
            last: self.last.or(self.skip_through),
        }
    }

    fn is_stopped(&self) -> bool {
        self.token.map_or(false, ProgressToken::is_stopped)
    }

    fn limit_reached(&self) -> bool {
        self.options.limit != 0 && self.yielded >= self.options.limit
    }

    fn feed(&mut self, pos: u64, byte: u8) -> bool {
        let opts = &self.options;
        let out = &mut self.candidates;
        let mut boundary = false;
        if let Some(ansi) = &mut self.ansi {
            boundary |= ansi.feed(pos, byte, opts, out);
        }
        if let Some(utf8) = &mut self.utf8 {
            boundary |= utf8.feed(pos, byte, opts, out);
        }
        if let Some(lanes) = &mut self.lanes {
            for lane in lanes.iter_mut() {
                boundary |= lane.feed(pos, byte, opts, out);
            }
        }
        boundary
    }

    fn finish_input(&mut self) {
        let out = &mut self.candidates;
        if let Some(ansi) = &mut self.ansi {
            ansi.emit(Terminator::End, out);
        }
        if let Some(utf8) = &mut self.utf8 {
            utf8.finish(out);
        }
        if let Some(lanes) = &mut self.lanes {
            for lane in lanes.iter_mut() {
                lane.low = None;
                lane.emit(Terminator::End, out);
            }
        }
        self.input_done = true;
        self.drain_candidates();
    }

    fn drain_candidates(&mut self) {
        for c in std::mem::take(&mut self.candidates) {
            if c.chars < self.options.min_length {
                continue;
            }
            if self.options.c_strings_only && c.terminator != Terminator::Nul {
                continue;
            }
            let key = (c.offset, c.kind, self.seq);
            self.seq += 1;
            let record = self.options.accepts_text(&c.text).then(|| MatchRecord {
                offset: c.offset,
                size: c.size,
                kind: c.kind,
                text: c.text,
                info: String::new(),
            });
            self.pending.insert(key, record);
        }
    }

    fn cancel(&mut self) {
        tracing::debug!(offset = self.pos, yielded = self.yielded, "string scan cancelled");
        self.drain_candidates();
        self.cancelled = true;
    }

    /// Read and classify the next chunk.
    fn advance(&mut self) {
        if self.is_stopped() {
            self.cancel();
            return;
        }
        if self.pos >= self.end {
            self.finish_input();
            return;
        }
        let want = usize::try_from(self.end - self.pos)
            .unwrap_or(usize::MAX)
            .min(self.buf.len());
        let mut buf = std::mem::take(&mut self.buf);
        let n = self.device.read_into(self.pos, &mut buf[..want]);
        if n == 0 {
            self.buf = buf;
            self.finish_input();
            return;
        }
        for (i, &byte) in buf[..n].iter().enumerate() {
            let at = self.pos + i as u64;
            if self.feed(at, byte) && self.is_stopped() {
                self.pos = at + 1;
                self.buf = buf;
                self.cancel();
                return;
            }
        }
        self.buf = buf;
        self.pos += n as u64;
        if let Some(slot) = &self.slot {
            slot.set_current(self.pos - self.start);
        }
        self.drain_candidates();
        if n < want {
            self.finish_input();
        }
    }

    fn watermark(&self) -> u64 {
        if self.input_done {
            return u64::MAX;
        }
        let open = [
            self.ansi.as_ref().and_then(AnsiRun::open_at),
            self.utf8.as_ref().and_then(Utf8Run::open_at),
            self.lanes.as_ref().and_then(|l| l[0].open_at()),
            self.lanes.as_ref().and_then(|l| l[1].open_at()),
        ];
        open.into_iter().flatten().fold(self.pos, u64::min)
    }

    fn pop_ready(&mut self) -> Option<MatchRecord> {
        if self.cancelled {
            return None;
        }
        let watermark = self.watermark();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 >= watermark {
                return None;
            }
            let ((offset, kind, _), record) = entry.remove_entry();
            let Some(record) = record else {
                continue;
            };
            if self
                .skip_through
                .map_or(false, |last| (offset, kind) <= last)
            {
                continue;
            }
            return Some(record);
        }
        None
    }
}

impl Iterator for MultiSearch<'_, '_> {
    type Item = MatchRecord;

    fn next(&mut self) -> Option<MatchRecord> {
        loop {
            if self.limit_reached() {
                return None;
            }
            if let Some(record) = self.pop_ready() {
                self.yielded += 1;
                self.last = Some((record.offset, record.kind));
                return Some(record);
            }
            if self.cancelled || self.input_done {
                return None;
            }
            self.advance();
        }
    }
}

/// String scanner configured once and run over any number of ranges.
#[derive(Debug, Clone, Default)]
pub struct StringScanner {
    options: StringScanOptions,
}

impl StringScanner {
    /// Scanner with `options`.
    pub fn new(options: StringScanOptions) -> Self {
        Self { options }
    }

    /// The configured options.
    pub fn options(&self) -> &StringScanOptions {
        &self.options
    }

    /// Scan `[offset, offset + size)`; `size = None` scans to the end.
    pub fn scan<'d, 'a>(
        &self,
        device: &'d mut Device<'a>,
        offset: u64,
        size: Option<u64>,
        token: Option<&'d ProgressToken>,
    ) -> MultiSearch<'d, 'a> {
        MultiSearch::new(device, self.options.clone(), offset, size, token)
    }

    /// Continue a scan from a saved cursor.
    pub fn resume<'d, 'a>(
        &self,
        device: &'d mut Device<'a>,
        cursor: ScanCursor,
        token: Option<&'d ProgressToken>,
    ) -> MultiSearch<'d, 'a> {
        let size = cursor.end.saturating_sub(cursor.position);
        let mut search = MultiSearch::new(device, self.options.clone(), cursor.position, Some(size), token);
        search.skip_through = cursor.last;
        search
    }

    /// Collect every match of a range.
    pub fn collect(
        &self,
        device: &mut Device<'_>,
        offset: u64,
        size: Option<u64>,
        token: Option<&ProgressToken>,
    ) -> Vec<MatchRecord> {
        self.scan(device, offset, size, token).collect()
    }
}
