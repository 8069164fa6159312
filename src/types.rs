//! Core types shared across the engine.
//!
//! File type tags, addressing modes and byte order live here so that the
//! memory map, the dispatcher and the format collaborators agree on one
//! vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte ordering (endianness).
///
/// Every multi-byte access in the engine takes one of these explicitly; the
/// host byte order is never assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    /// Little-endian byte order.
    #[default]
    Little,
    /// Big-endian byte order.
    Big,
}

impl Endianness {
    /// Build from a "big endian" flag.
    pub fn from_big(big_endian: bool) -> Self {
        if big_endian {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// Whether this is big-endian.
    pub fn is_big(self) -> bool {
        matches!(self, Endianness::Big)
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Little => write!(f, "LE"),
            Endianness::Big => write!(f, "BE"),
        }
    }
}

/// Addressing mode (bit-width) of a binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Mode could not be determined.
    #[default]
    Unknown,
    /// Raw data, no code.
    Data,
    /// 16-bit flat.
    Bits16,
    /// 16-bit segmented (real mode, NE).
    Bits16Seg,
    /// 32-bit.
    Bits32,
    /// 64-bit.
    Bits64,
}

impl Mode {
    /// Pointer width in bytes, if the mode has one.
    pub fn address_width(self) -> Option<u8> {
        match self {
            Mode::Bits16 | Mode::Bits16Seg => Some(2),
            Mode::Bits32 => Some(4),
            Mode::Bits64 => Some(8),
            Mode::Unknown | Mode::Data => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Unknown => "unknown",
            Mode::Data => "data",
            Mode::Bits16 => "16-bit",
            Mode::Bits16Seg => "16-bit (segmented)",
            Mode::Bits32 => "32-bit",
            Mode::Bits64 => "64-bit",
        };
        write!(f, "{s}")
    }
}

/// File type tag.
///
/// Generic tags (`Pe`, `Elf`, ...) are reported together with their
/// width-specific refinements (`Pe32`, `Elf64`, ...), mirroring how a single
/// file is usually "a PE" and "a PE64" at the same time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FileType {
    /// Nothing is known about the data.
    #[default]
    Unknown,
    /// Any byte stream.
    Binary,
    /// DOS MZ executable
    MsDos,
    /// NE (New Executable) - 16-bit Windows/OS2
    Ne,
    /// LE (Linear Executable) - OS/2, VxD
    Le,
    /// LX (Linear Executable Extended) - OS/2
    Lx,
    /// Portable Executable (Windows)
    Pe,
    /// PE32
    Pe32,
    /// PE32+
    Pe64,
    /// Executable and Linkable Format
    Elf,
    /// ELFCLASS32
    Elf32,
    /// ELFCLASS64
    Elf64,
    /// Mach-O (macOS, iOS)
    MachO,
    /// 32-bit Mach-O
    MachO32,
    /// 64-bit Mach-O
    MachO64,
    /// Amiga Hunk executable
    AmigaHunk,
    /// PNG image
    Png,
    /// ar archive
    Ar,
    /// Text of any encoding
    Text,
    /// UTF-8 text with BOM
    Utf8,
    /// UTF-16 text
    Unicode,
    /// UTF-16LE text with BOM
    UnicodeLe,
    /// UTF-16BE text with BOM
    UnicodeBe,
}

impl FileType {
    /// Preference order used when several types claim the same bytes,
    /// highest priority first. Declared, not computed.
    pub const PRIORITY: &'static [FileType] = &[
        FileType::Pe64,
        FileType::Pe32,
        FileType::Pe,
        FileType::Elf64,
        FileType::Elf32,
        FileType::Elf,
        FileType::MachO64,
        FileType::MachO32,
        FileType::MachO,
        FileType::Lx,
        FileType::Le,
        FileType::Ne,
        FileType::MsDos,
        FileType::AmigaHunk,
        FileType::Png,
        FileType::Ar,
        FileType::UnicodeLe,
        FileType::UnicodeBe,
        FileType::Unicode,
        FileType::Utf8,
        FileType::Text,
        FileType::Binary,
        FileType::Unknown,
    ];

    /// Rank in [`FileType::PRIORITY`]; lower is preferred.
    pub fn priority(self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|&t| t == self)
            .unwrap_or(Self::PRIORITY.len())
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            FileType::Unknown => "Unknown",
            FileType::Binary => "Binary",
            FileType::MsDos => "MSDOS",
            FileType::Ne => "NE",
            FileType::Le => "LE",
            FileType::Lx => "LX",
            FileType::Pe => "PE",
            FileType::Pe32 => "PE32",
            FileType::Pe64 => "PE64",
            FileType::Elf => "ELF",
            FileType::Elf32 => "ELF32",
            FileType::Elf64 => "ELF64",
            FileType::MachO => "Mach-O",
            FileType::MachO32 => "Mach-O32",
            FileType::MachO64 => "Mach-O64",
            FileType::AmigaHunk => "Amiga Hunk",
            FileType::Png => "PNG",
            FileType::Ar => "ar",
            FileType::Text => "Text",
            FileType::Utf8 => "UTF-8",
            FileType::Unicode => "Unicode",
            FileType::UnicodeLe => "Unicode LE",
            FileType::UnicodeBe => "Unicode BE",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_is_total() {
        let all = [
            FileType::Unknown,
            FileType::Binary,
            FileType::MsDos,
            FileType::Ne,
            FileType::Le,
            FileType::Lx,
            FileType::Pe,
            FileType::Pe32,
            FileType::Pe64,
            FileType::Elf,
            FileType::Elf32,
            FileType::Elf64,
            FileType::MachO,
            FileType::MachO32,
            FileType::MachO64,
            FileType::AmigaHunk,
            FileType::Png,
            FileType::Ar,
            FileType::Text,
            FileType::Utf8,
            FileType::Unicode,
            FileType::UnicodeLe,
            FileType::UnicodeBe,
        ];
        for t in all {
            assert!(t.priority() < FileType::PRIORITY.len(), "{t} missing");
        }
    }

    #[test]
    fn test_priority_order() {
        assert!(FileType::Pe64.priority() < FileType::MsDos.priority());
        assert!(FileType::MsDos.priority() < FileType::Binary.priority());
        assert!(FileType::Elf32.priority() < FileType::Elf.priority());
    }

    #[test]
    fn test_mode_width() {
        assert_eq!(Mode::Bits64.address_width(), Some(8));
        assert_eq!(Mode::Data.address_width(), None);
    }

    #[test]
    fn test_endianness() {
        assert!(Endianness::from_big(true).is_big());
        assert_eq!(Endianness::default(), Endianness::Little);
        assert_eq!(Endianness::Big.to_string(), "BE");
    }
}
