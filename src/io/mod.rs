//! Bounded device I/O.
//!
//! [`ByteSource`] abstracts the caller's stream; [`Device`] wraps a borrowed
//! source with the bounded, endian-explicit reads the rest of the engine is
//! written against.

mod device;
mod source;

pub use device::{Device, SEARCH_CHUNK};
pub use source::{ByteSource, SharedSource, StreamSource};
