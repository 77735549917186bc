//! AMF0 / AMF3 value codec.
//!
//! Dynamic AMF values are modelled as a tagged sum over
//! `{null, bool, int32, f64, string, bytes, object, date}`;
//! objects are **insertion-ordered** maps ([`AmfObject`]), so the field
//! order an encoder produces is exactly the order its author set the
//! fields in — both AMF0 and AMF3 depend on that for cross-implementation
//! agreement.
//!
//! Readers keep the reference tables the formats require: one object
//! table for AMF0, and string/object/traits tables for AMF3, all scoped
//! to a single message.
//!
//! Dates travel as Unix milliseconds (UTC) and stay that way in
//! [`AmfValue::Date`] — no locale or timezone handling.

#![deny(unsafe_code)]

pub mod amf0;
pub mod amf3;
mod object;

pub use object::{AmfObject, AmfValue};

use thiserror::Error;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while decoding or encoding AMF values.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum AmfError {
    /// Ran out of bytes mid-value.
    #[error("unexpected end of buffer")]
    UnexpectedEof,
    /// A marker byte that this codec does not support.
    #[error("unsupported marker {0:#04x}")]
    UnsupportedMarker(u8),
    /// A typed read found a different marker than requested.
    #[error("expected {expected}, found marker {found:#04x}")]
    TypeMismatch {
        /// What the caller asked for.
        expected: &'static str,
        /// The marker actually present.
        found: u8,
    },
    /// A backreference index outside the reference table.
    #[error("reference {0} out of range")]
    BadReference(usize),
    /// A backreference resolved to a value of the wrong kind.
    #[error("reference is not a {0}")]
    WrongReferenceKind(&'static str),
    /// An integer outside the AMF3 29-bit signed range.
    #[error("integer outside the AMF3 29-bit range")]
    IntegerRange,
    /// A value kind that cannot be encoded.
    #[error("value cannot be encoded in this format")]
    Unencodable,
    /// Byte-level coding failure.
    #[error(transparent)]
    Wire(#[from] rill_wire::WireError),
}

/// Specialized `Result` for AMF coding.
pub type Result<T> = std::result::Result<T, AmfError>;
