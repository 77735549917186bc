//! Byte-level codecs for the RTMFP wire format.
//!
//! Everything here operates on in-memory buffers:
//! * [`PacketReader`] — zero-copy cursor over a received datagram
//! * [`PacketWriter`] — growable buffer with offset back-patching
//!
//! Integers are big-endian. Variable-width integers use the RTMFP 7-bit
//! groups-with-continuation format capped at a full 8-bit tail byte
//! (see [`PacketReader::read_7bit_u32`]). Length-prefixed strings are
//! opaque byte sequences — the protocol never promises UTF-8.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod reader;
mod writer;

pub use reader::PacketReader;
pub use writer::{PacketWriter, size_of_7bit_u32, size_of_7bit_u64};

use std::fmt;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while reading or writing wire data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Ran out of bytes before the value was fully read.
    UnexpectedEof,
    /// A variable-width integer exceeds its encodable range
    /// (`2^29` for 32-bit, `2^57` for 64-bit).
    TooLarge,
    /// A string exceeds its length-prefix range.
    TooLong,
    /// An offset points outside the buffer.
    InvalidOffset,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::TooLarge      => write!(f, "value exceeds 7-bit-varint range"),
            Self::TooLong       => write!(f, "string exceeds length-prefix range"),
            Self::InvalidOffset => write!(f, "offset outside buffer"),
        }
    }
}

impl std::error::Error for WireError {}

/// Specialized `Result` for wire coding.
pub type Result<T> = std::result::Result<T, WireError>;
