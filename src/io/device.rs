//! Bounded, endian-explicit access to a borrowed byte source.

use crate::error::{EngineError, Result};
use crate::progress::ProgressToken;
use crate::types::Endianness;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memchr::memmem;

use super::ByteSource;

/// Chunk size for forward searches.
pub const SEARCH_CHUNK: usize = 0x10_0000;

/// A borrowed byte source with bounded reads and checked writes.
///
/// Reads never go past the end of the stream: they return the bytes that
/// exist. Scalar reads past the end are zero-filled so that tolerant parsers
/// of damaged files keep working. Every multi-byte access names its byte
/// order.
pub struct Device<'a> {
    source: &'a mut dyn ByteSource,
    size: Option<u64>,
}

impl std::fmt::Debug for Device<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("size", &self.size).finish()
    }
}

macro_rules! scalar_reader {
    ($(#[$doc:meta] $name:ident -> $ty:ty, $len:expr, $read:ident;)*) => {
        $(
            #[$doc]
            pub fn $name(&mut self, offset: u64, endian: Endianness) -> $ty {
                let buf = self.read_array::<$len>(offset);
                match endian {
                    Endianness::Little => LittleEndian::$read(&buf),
                    Endianness::Big => BigEndian::$read(&buf),
                }
            }
        )*
    };
}

macro_rules! scalar_finder {
    ($(#[$doc:meta] $name:ident($ty:ty);)*) => {
        $(
            #[$doc]
            pub fn $name(
                &mut self,
                offset: u64,
                size: Option<u64>,
                value: $ty,
                endian: Endianness,
                token: Option<&ProgressToken>,
            ) -> Option<u64> {
                let bytes = match endian {
                    Endianness::Little => value.to_le_bytes(),
                    Endianness::Big => value.to_be_bytes(),
                };
                self.find_bytes(offset, size, &bytes, token)
            }
        )*
    };
}

impl<'a> Device<'a> {
    /// Borrow `source` for one operation.
    pub fn new(source: &'a mut dyn ByteSource) -> Self {
        let size = source.size();
        Self { source, size }
    }

    /// Stream length; `u64::MAX` when the source cannot report one.
    pub fn size(&self) -> u64 {
        self.size.unwrap_or(u64::MAX)
    }

    /// Whether the source reported its length.
    pub fn is_size_known(&self) -> bool {
        self.size.is_some()
    }

    /// Whether `offset` addresses an existing byte.
    pub fn is_offset_valid(&self, offset: u64) -> bool {
        offset < self.size()
    }

    /// Whether `[offset, offset + size)` lies inside the stream.
    pub fn is_offset_and_size_valid(&self, offset: u64, size: u64) -> bool {
        offset
            .checked_add(size)
            .map_or(false, |end| self.is_offset_valid(offset) && end <= self.size())
    }

    /// Clamp a range to the stream. `None` means "to the end".
    pub fn clamp_range(&self, offset: u64, size: Option<u64>) -> (u64, u64) {
        let total = self.size();
        if offset >= total {
            return (offset, 0);
        }
        let avail = total - offset;
        (offset, size.map_or(avail, |s| s.min(avail)))
    }

    /// Read into `buf`, returning the number of bytes actually read.
    ///
    /// I/O failures are logged and reported as a short read.
    pub fn read_into(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        let limit = match self.size {
            Some(size) if offset >= size => return 0,
            Some(size) => buf.len().min(usize::try_from(size - offset).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        match self.source.read_at(offset, &mut buf[..limit]) {
            Ok(n) => n.min(limit),
            Err(err) => {
                tracing::warn!(offset, %err, "read failed");
                0
            }
        }
    }

    /// Read up to `max_len` bytes at `offset`.
    ///
    /// On a source of unknown length the buffer grows one [`SEARCH_CHUNK`]
    /// at a time, so `max_len` is a limit rather than an allocation size.
    pub fn read_bytes(&mut self, offset: u64, max_len: usize) -> Vec<u8> {
        let (_, avail) = self.clamp_range(offset, Some(max_len as u64));
        let want = usize::try_from(avail).unwrap_or(max_len);
        if self.is_size_known() {
            let mut buf = vec![0u8; want];
            let n = self.read_into(offset, &mut buf);
            buf.truncate(n);
            return buf;
        }
        let mut buf = Vec::new();
        while buf.len() < want {
            let filled = buf.len();
            let step = (want - filled).min(SEARCH_CHUNK);
            buf.resize(filled + step, 0);
            let n = self.read_into(offset + filled as u64, &mut buf[filled..]);
            buf.truncate(filled + n);
            if n < step {
                break;
            }
        }
        buf
    }

    /// Read exactly `len` bytes or fail with [`EngineError::Truncated`].
    pub fn read_exact(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buf = self.read_bytes(offset, len);
        if buf.len() < len {
            return Err(EngineError::Truncated {
                offset,
                expected: len,
                actual: buf.len(),
            });
        }
        Ok(buf)
    }

    /// Read `N` bytes, zero-filling whatever lies past the end.
    pub fn read_array<const N: usize>(&mut self, offset: u64) -> [u8; N] {
        let mut buf = [0u8; N];
        self.read_into(offset, &mut buf);
        buf
    }

    /// Read one byte, zero past the end.
    pub fn read_u8(&mut self, offset: u64) -> u8 {
        self.read_array::<1>(offset)[0]
    }

    /// Read one signed byte, zero past the end.
    pub fn read_i8(&mut self, offset: u64) -> i8 {
        self.read_u8(offset) as i8
    }

    scalar_reader! {
        /// Read a `u16`, zero-filled past the end.
        read_u16 -> u16, 2, read_u16;
        /// Read an `i16`, zero-filled past the end.
        read_i16 -> i16, 2, read_i16;
        /// Read a `u32`, zero-filled past the end.
        read_u32 -> u32, 4, read_u32;
        /// Read an `i32`, zero-filled past the end.
        read_i32 -> i32, 4, read_i32;
        /// Read a `u64`, zero-filled past the end.
        read_u64 -> u64, 8, read_u64;
        /// Read an `i64`, zero-filled past the end.
        read_i64 -> i64, 8, read_i64;
        /// Read an `f32`, zero-filled past the end.
        read_f32 -> f32, 4, read_f32;
        /// Read an `f64`, zero-filled past the end.
        read_f64 -> f64, 8, read_f64;
    }

    /// Read an unsigned value of `width` bytes (1, 2, 4 or 8).
    pub fn read_value(&mut self, offset: u64, width: u8, endian: Endianness) -> Option<u64> {
        match width {
            1 => Some(u64::from(self.read_u8(offset))),
            2 => Some(u64::from(self.read_u16(offset, endian))),
            4 => Some(u64::from(self.read_u32(offset, endian))),
            8 => Some(self.read_u64(offset, endian)),
            _ => None,
        }
    }

    /// Read a sign-extended value of `width` bytes (1, 2, 4 or 8).
    pub fn read_signed(&mut self, offset: u64, width: u8, endian: Endianness) -> Option<i64> {
        match width {
            1 => Some(i64::from(self.read_i8(offset))),
            2 => Some(i64::from(self.read_i16(offset, endian))),
            4 => Some(i64::from(self.read_i32(offset, endian))),
            8 => Some(self.read_i64(offset, endian)),
            _ => None,
        }
    }

    /// Read a NUL-terminated single-byte string, at most `max_len` bytes.
    ///
    /// Bytes are decoded as Latin-1, so no input is lost.
    pub fn read_ansi_string(&mut self, offset: u64, max_len: usize) -> String {
        let buf = self.read_bytes(offset, max_len);
        let end = memchr::memchr(0, &buf).unwrap_or(buf.len());
        buf[..end].iter().map(|&b| char::from(b)).collect()
    }

    /// Read a NUL-terminated UTF-8 string, at most `max_len` bytes.
    pub fn read_utf8_string(&mut self, offset: u64, max_len: usize) -> String {
        let buf = self.read_bytes(offset, max_len);
        let end = memchr::memchr(0, &buf).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    /// Read a NUL-terminated UTF-16 string of at most `max_chars` units.
    pub fn read_unicode_string(
        &mut self,
        offset: u64,
        max_chars: usize,
        endian: Endianness,
    ) -> String {
        let buf = self.read_bytes(offset, max_chars.saturating_mul(2));
        let units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|c| match endian {
                Endianness::Little => LittleEndian::read_u16(c),
                Endianness::Big => BigEndian::read_u16(c),
            })
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    /// Write `data` at `offset`.
    ///
    /// On a source that cannot grow, a write that would end past the current
    /// size fails with [`EngineError::SizeExceeded`] and writes nothing.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(EngineError::SizeExceeded {
                offset,
                len: data.len(),
                size: self.size(),
            })?;
        if !self.source.is_growable() && end > self.size() {
            return Err(EngineError::SizeExceeded {
                offset,
                len: data.len(),
                size: self.size(),
            });
        }
        let n = self.source.write_at(offset, data)?;
        if let Some(size) = self.size {
            self.size = Some(size.max(offset + n as u64));
        }
        Ok(n)
    }

    /// Write one byte.
    pub fn write_u8(&mut self, offset: u64, value: u8) -> Result<()> {
        self.write_bytes(offset, &[value]).map(|_| ())
    }

    /// Write a `u16`.
    pub fn write_u16(&mut self, offset: u64, value: u16, endian: Endianness) -> Result<()> {
        let mut buf = [0u8; 2];
        match endian {
            Endianness::Little => LittleEndian::write_u16(&mut buf, value),
            Endianness::Big => BigEndian::write_u16(&mut buf, value),
        }
        self.write_bytes(offset, &buf).map(|_| ())
    }

    /// Write a `u32`.
    pub fn write_u32(&mut self, offset: u64, value: u32, endian: Endianness) -> Result<()> {
        let mut buf = [0u8; 4];
        match endian {
            Endianness::Little => LittleEndian::write_u32(&mut buf, value),
            Endianness::Big => BigEndian::write_u32(&mut buf, value),
        }
        self.write_bytes(offset, &buf).map(|_| ())
    }

    /// Write a `u64`.
    pub fn write_u64(&mut self, offset: u64, value: u64, endian: Endianness) -> Result<()> {
        let mut buf = [0u8; 8];
        match endian {
            Endianness::Little => LittleEndian::write_u64(&mut buf, value),
            Endianness::Big => BigEndian::write_u64(&mut buf, value),
        }
        self.write_bytes(offset, &buf).map(|_| ())
    }

    /// Whether the bytes at `offset` equal `expected`.
    pub fn starts_with_at(&mut self, offset: u64, expected: &[u8]) -> bool {
        let mut buf = vec![0u8; expected.len()];
        self.read_into(offset, &mut buf) == expected.len() && buf == expected
    }

    /// Find the first occurrence of `needle` that lies entirely inside
    /// `[offset, offset + size)`. `size = None` searches to the end.
    ///
    /// Polls `token` once per chunk and gives up when it is stopped.
    pub fn find_bytes(
        &mut self,
        offset: u64,
        size: Option<u64>,
        needle: &[u8],
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        if needle.is_empty() {
            return None;
        }
        let finder = memmem::Finder::new(needle);
        self.find_with(offset, size, needle.len(), token, |buf| finder.find(buf))
    }

    /// Chunked forward search driving `find` over each buffer.
    ///
    /// `find` returns the start of the first complete match in the buffer.
    /// Matches are at most `window` bytes long; a match starting in the last
    /// `window - 1` bytes of a chunk is re-found in the next one.
    fn find_with(
        &mut self,
        offset: u64,
        size: Option<u64>,
        window: usize,
        token: Option<&ProgressToken>,
        mut find: impl FnMut(&[u8]) -> Option<usize>,
    ) -> Option<u64> {
        let (start, len) = self.clamp_range(offset, size);
        let end = start + len;
        let overlap = window.saturating_sub(1);
        let slot = token.map(|t| t.acquire(len));

        let mut pos = start;
        let mut buf = vec![0u8; SEARCH_CHUNK.max(window.saturating_mul(2))];
        while pos < end {
            if token.map_or(false, ProgressToken::is_stopped) {
                tracing::debug!(offset = pos, "search cancelled");
                return None;
            }
            let want = usize::try_from(end - pos).unwrap_or(usize::MAX).min(buf.len());
            let n = self.read_into(pos, &mut buf[..want]);
            let last = n < want || pos + n as u64 >= end;
            match find(&buf[..n]) {
                Some(i) if last || i < n - overlap => return Some(pos + i as u64),
                _ if last => return None,
                _ => {}
            }
            pos += (n - overlap) as u64;
            if let Some(slot) = &slot {
                slot.set_current(pos - start);
            }
        }
        None
    }

    /// Find the first occurrence of an ASCII string.
    pub fn find_ansi_string(
        &mut self,
        offset: u64,
        size: Option<u64>,
        text: &str,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        self.find_bytes(offset, size, text.as_bytes(), token)
    }

    /// Find the first occurrence of `text` encoded as UTF-16.
    pub fn find_unicode_string(
        &mut self,
        offset: u64,
        size: Option<u64>,
        text: &str,
        endian: Endianness,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        let needle: Vec<u8> = text
            .encode_utf16()
            .flat_map(|u| match endian {
                Endianness::Little => u.to_le_bytes(),
                Endianness::Big => u.to_be_bytes(),
            })
            .collect();
        self.find_bytes(offset, size, &needle, token)
    }

    /// Find the first occurrence of `text` encoded as UTF-8.
    pub fn find_utf8_string(
        &mut self,
        offset: u64,
        size: Option<u64>,
        text: &str,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        self.find_bytes(offset, size, text.as_bytes(), token)
    }

    /// Case-insensitive [`find_ansi_string`](Self::find_ansi_string).
    ///
    /// Bytes are Latin-1, so `À` matches `à`.
    pub fn find_ansi_string_i(
        &mut self,
        offset: u64,
        size: Option<u64>,
        text: &str,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        let needle = text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok().map(fold_latin1))
            .collect::<Option<Vec<u8>>>()?;
        if needle.is_empty() {
            return None;
        }
        self.find_with(offset, size, needle.len(), token, |buf| {
            buf.windows(needle.len()).position(|w| {
                w.iter().zip(&needle).all(|(&b, &n)| fold_latin1(b) == n)
            })
        })
    }

    /// Case-insensitive [`find_unicode_string`](Self::find_unicode_string).
    pub fn find_unicode_string_i(
        &mut self,
        offset: u64,
        size: Option<u64>,
        text: &str,
        endian: Endianness,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        let needle: Vec<u16> = text.encode_utf16().map(fold_unit).collect();
        if needle.is_empty() {
            return None;
        }
        let unit = |c: &[u8]| match endian {
            Endianness::Little => LittleEndian::read_u16(c),
            Endianness::Big => BigEndian::read_u16(c),
        };
        self.find_with(offset, size, needle.len() * 2, token, |buf| {
            (0..buf.len().saturating_sub(needle.len() * 2 - 1)).find(|&i| {
                buf[i..]
                    .chunks_exact(2)
                    .zip(&needle)
                    .all(|(c, &n)| fold_unit(unit(c)) == n)
            })
        })
    }

    /// Case-insensitive [`find_utf8_string`](Self::find_utf8_string).
    ///
    /// Characters are compared by their Unicode lowercase mapping.
    pub fn find_utf8_string_i(
        &mut self,
        offset: u64,
        size: Option<u64>,
        text: &str,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        let needle: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();
        if needle.is_empty() {
            return None;
        }
        self.find_with(offset, size, needle.len() * 4, token, |buf| {
            (0..buf.len())
                .filter(|&i| !is_utf8_continuation(buf[i]))
                .find(|&i| utf8_folded_prefix(&buf[i..], &needle))
        })
    }

    /// Find the first occurrence of a byte.
    pub fn find_u8(
        &mut self,
        offset: u64,
        size: Option<u64>,
        value: u8,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        self.find_bytes(offset, size, &[value], token)
    }

    /// Find the first occurrence of a signed byte.
    pub fn find_i8(
        &mut self,
        offset: u64,
        size: Option<u64>,
        value: i8,
        token: Option<&ProgressToken>,
    ) -> Option<u64> {
        self.find_bytes(offset, size, &value.to_le_bytes(), token)
    }

    scalar_finder! {
        /// Find the first occurrence of a `u16`.
        find_u16(u16);
        /// Find the first occurrence of an `i16`.
        find_i16(i16);
        /// Find the first occurrence of a `u32`.
        find_u32(u32);
        /// Find the first occurrence of an `i32`.
        find_i32(i32);
        /// Find the first occurrence of a `u64`.
        find_u64(u64);
        /// Find the first occurrence of an `i64`.
        find_i64(i64);
        /// Find the first occurrence of an `f32`, compared bit for bit.
        find_f32(f32);
        /// Find the first occurrence of an `f64`, compared bit for bit.
        find_f64(f64);
    }
}

/// Latin-1 lowercase.
fn fold_latin1(byte: u8) -> u8 {
    match byte {
        b'A'..=b'Z' | 0xC0..=0xD6 | 0xD8..=0xDE => byte + 0x20,
        _ => byte,
    }
}

/// Lowercase of a UTF-16 unit when it maps to a single BMP character.
fn fold_unit(unit: u16) -> u16 {
    let Some(c) = char::from_u32(u32::from(unit)) else {
        return unit;
    };
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => u16::try_from(u32::from(l)).unwrap_or(unit),
        _ => unit,
    }
}

fn is_utf8_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Decode one UTF-8 character at the start of `bytes`.
fn decode_utf8(bytes: &[u8]) -> Option<(char, usize)> {
    let len = match bytes.first()? {
        0x00..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return None,
    };
    let text = std::str::from_utf8(bytes.get(..len)?).ok()?;
    text.chars().next().map(|c| (c, len))
}

/// Whether `bytes` starts with characters whose lowercase forms spell `needle`.
fn utf8_folded_prefix(mut bytes: &[u8], needle: &[char]) -> bool {
    let mut want = needle.iter();
    let mut left = needle.len();
    while left > 0 {
        let Some((c, len)) = decode_utf8(bytes) else {
            return false;
        };
        for l in c.to_lowercase() {
            if want.next() != Some(&l) {
                return false;
            }
            left -= 1;
        }
        bytes = &bytes[len..];
    }
    true
}
