//! Error types for the binprobe engine.
//!
//! Most "negative" outcomes of binary probing are not errors: an unmapped
//! address is `None`, a short read reports the bytes actually available, a
//! signature mismatch is `false`, and a cancelled scan returns the matches
//! gathered so far. `EngineError` covers the conditions a caller has to act
//! on.

use thiserror::Error;

/// Primary error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO error from the underlying byte source.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A write would extend a byte source that cannot grow.
    #[error("Size exceeded: write of {len} bytes at offset 0x{offset:X} past fixed size 0x{size:X}")]
    SizeExceeded { offset: u64, len: usize, size: u64 },

    /// Fewer bytes were available than a structure requires.
    #[error("Truncated data at offset 0x{offset:X}: expected {expected} bytes, got {actual}")]
    Truncated {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// Malformed signature text.
    #[error("Signature compile error at position {position}: {message}")]
    PatternCompile { position: usize, message: String },

    /// A string filter expression failed to compile.
    #[error("Invalid string filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    /// A format collaborator found structurally invalid data.
    #[error("{format} parse error: {message}")]
    InvalidFormat { format: String, message: String },
}

impl EngineError {
    /// Create an `InvalidFormat` error.
    pub fn invalid_format(format: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidFormat {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create a `PatternCompile` error.
    pub fn pattern(position: usize, message: impl Into<String>) -> Self {
        EngineError::PatternCompile {
            position,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
