//! AMF0 codec.
//!
//! AMF0 is the outer encoding of every RPC message: command name,
//! callback number, then arguments. A message may switch to AMF3 with
//! the `avmplus` marker (`0x11`); the embedded AMF3 state persists for
//! the rest of the message.

use rill_wire::{PacketReader, PacketWriter};

use crate::{AmfError, AmfObject, AmfValue, Result, amf3};

// ─── Markers ─────────────────────────────────────────────────────────────────

pub(crate) const MARKER_NUMBER: u8 = 0x00;
pub(crate) const MARKER_BOOLEAN: u8 = 0x01;
pub(crate) const MARKER_STRING: u8 = 0x02;
pub(crate) const MARKER_OBJECT: u8 = 0x03;
pub(crate) const MARKER_NULL: u8 = 0x05;
pub(crate) const MARKER_UNDEFINED: u8 = 0x06;
pub(crate) const MARKER_REFERENCE: u8 = 0x07;
pub(crate) const MARKER_OBJECT_END: u8 = 0x09;
pub(crate) const MARKER_DATE: u8 = 0x0b;
pub(crate) const MARKER_AVMPLUS: u8 = 0x11;

// ─── Reader ──────────────────────────────────────────────────────────────────

/// An AMF0 decoder over a packet reader.
///
/// Typed entry points (`read_string`, `read_number`, …) accept a null
/// marker in place of the requested type and return the zero value —
/// RPC callers routinely pass null for omitted arguments.
pub struct Amf0Reader<'a, 'r> {
    r: &'r mut PacketReader<'a>,
    object_refs: Vec<AmfValue>,
    amf3: Option<amf3::ReadTables>,
}

impl<'a, 'r> Amf0Reader<'a, 'r> {
    /// Wrap a packet reader.
    pub fn new(r: &'r mut PacketReader<'a>) -> Self {
        Self { r, object_refs: Vec::new(), amf3: None }
    }

    /// Remaining undecoded bytes.
    pub fn remaining(&self) -> usize {
        self.r.remaining()
    }

    /// The remaining bytes, unconsumed — forwarded verbatim by the
    /// proxy/broadcast/relay commands.
    pub fn rest(&self) -> &'a [u8] {
        self.r.rest()
    }

    fn read_marker(&mut self) -> Result<u8> {
        self.r.read_u8().map_err(|_| AmfError::UnexpectedEof)
    }

    /// Read any one value.
    pub fn read_value(&mut self) -> Result<AmfValue> {
        match self.read_marker()? {
            MARKER_NULL | MARKER_UNDEFINED => Ok(AmfValue::Null),
            MARKER_BOOLEAN => Ok(AmfValue::Boolean(self.read_boolean_value()?)),
            MARKER_NUMBER => Ok(AmfValue::Number(self.r.read_f64()?)),
            MARKER_STRING => Ok(AmfValue::String(self.read_string_value()?)),
            MARKER_DATE => Ok(AmfValue::Date(self.read_date_value()?)),
            MARKER_OBJECT => Ok(AmfValue::Object(self.read_object_value()?)),
            MARKER_REFERENCE => self.read_object_ref(),
            MARKER_AVMPLUS => {
                let tables = self.amf3.get_or_insert_with(amf3::ReadTables::default);
                amf3::read_value(self.r, tables)
            }
            m => Err(AmfError::UnsupportedMarker(m)),
        }
    }

    /// True if the next byte is the null marker.
    pub fn test_null(&self) -> bool {
        self.r.test_u8() == Ok(MARKER_NULL)
    }

    /// Consume a null marker.
    pub fn read_null(&mut self) -> Result<()> {
        match self.read_marker()? {
            MARKER_NULL => Ok(()),
            m => Err(AmfError::TypeMismatch { expected: "null", found: m }),
        }
    }

    /// Read a boolean (null → `false`).
    pub fn read_boolean(&mut self) -> Result<bool> {
        match self.read_marker()? {
            MARKER_NULL => Ok(false),
            MARKER_BOOLEAN => self.read_boolean_value(),
            m => Err(AmfError::TypeMismatch { expected: "boolean", found: m }),
        }
    }

    fn read_boolean_value(&mut self) -> Result<bool> {
        Ok(self.r.read_u8()? != 0)
    }

    /// Read a number (null → `0.0`).
    pub fn read_number(&mut self) -> Result<f64> {
        match self.read_marker()? {
            MARKER_NULL => Ok(0.0),
            MARKER_NUMBER => Ok(self.r.read_f64()?),
            m => Err(AmfError::TypeMismatch { expected: "number", found: m }),
        }
    }

    /// Read a string (null → empty).
    pub fn read_string(&mut self) -> Result<String> {
        match self.read_marker()? {
            MARKER_NULL => Ok(String::new()),
            MARKER_STRING => self.read_string_value(),
            m => Err(AmfError::TypeMismatch { expected: "string", found: m }),
        }
    }

    fn read_string_value(&mut self) -> Result<String> {
        let bytes = self.r.read_string16()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a date as Unix ms (null → `0`).
    pub fn read_date(&mut self) -> Result<i64> {
        match self.read_marker()? {
            MARKER_NULL => Ok(0),
            MARKER_DATE => self.read_date_value(),
            m => Err(AmfError::TypeMismatch { expected: "date", found: m }),
        }
    }

    fn read_date_value(&mut self) -> Result<i64> {
        let ms = self.r.read_f64()? as i64;
        // Timezone field — always zero on the wire, ignored.
        self.r.read_u16()?;
        Ok(ms)
    }

    /// Read an object (null → `None`).
    pub fn read_object(&mut self) -> Result<Option<AmfObject>> {
        match self.read_marker()? {
            MARKER_NULL => Ok(None),
            MARKER_OBJECT => Ok(Some(self.read_object_value()?)),
            m => Err(AmfError::TypeMismatch { expected: "object", found: m }),
        }
    }

    fn read_object_ref(&mut self) -> Result<AmfValue> {
        let idx = self.r.read_u16()? as usize;
        self.object_refs.get(idx).cloned().ok_or(AmfError::BadReference(idx))
    }

    fn read_object_value(&mut self) -> Result<AmfObject> {
        let slot = self.object_refs.len();
        self.object_refs.push(AmfValue::Null);

        let mut o = AmfObject::new();
        loop {
            let key = self.read_string_value()?;
            if key.is_empty() {
                break;
            }
            let v = self.read_value()?;
            o.set(key, v);
        }
        match self.r.read_u8()? {
            MARKER_OBJECT_END => {}
            m => return Err(AmfError::TypeMismatch { expected: "object end", found: m }),
        }
        self.object_refs[slot] = AmfValue::Object(o.clone());
        Ok(o)
    }
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// An AMF0 encoder that owns its output buffer.
///
/// The message layer writes its binary prefix through [`Amf0Writer::raw_mut`],
/// then appends AMF values; [`Amf0Writer::write_amf3`] switches a single
/// value to the AMF3 encoding under the `avmplus` marker.
#[derive(Default)]
pub struct Amf0Writer {
    w: PacketWriter,
    object_refs: Vec<AmfObject>,
    amf3: amf3::WriteTables,
}

impl Amf0Writer {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to the underlying buffer for raw prefixes/payloads.
    pub fn raw_mut(&mut self) -> &mut PacketWriter {
        &mut self.w
    }

    /// The encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        self.w.bytes()
    }

    /// Consume the encoder, yielding the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.w.into_bytes()
    }

    /// Write any one value. [`AmfValue::Integer`] and
    /// [`AmfValue::ByteArray`] have no AMF0 form.
    pub fn write_value(&mut self, v: &AmfValue) -> Result<()> {
        match v {
            AmfValue::Null => {
                self.write_null();
                Ok(())
            }
            AmfValue::Boolean(b) => {
                self.write_boolean(*b);
                Ok(())
            }
            AmfValue::Number(n) => {
                self.write_number(*n);
                Ok(())
            }
            AmfValue::String(s) => self.write_string(s),
            AmfValue::Date(ms) => {
                self.write_date(*ms);
                Ok(())
            }
            AmfValue::Object(o) => self.write_object(o),
            AmfValue::Integer(_) | AmfValue::ByteArray(_) => Err(AmfError::Unencodable),
        }
    }

    /// Write a null marker.
    pub fn write_null(&mut self) {
        self.w.write_u8(MARKER_NULL);
    }

    /// Write a boolean.
    pub fn write_boolean(&mut self, v: bool) {
        self.w.write_u8(MARKER_BOOLEAN);
        self.w.write_u8(u8::from(v));
    }

    /// Write a number.
    pub fn write_number(&mut self, v: f64) {
        self.w.write_u8(MARKER_NUMBER);
        self.w.write_f64(v);
    }

    /// Write a string.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.w.write_u8(MARKER_STRING);
        self.w.write_string16(s.as_bytes())?;
        Ok(())
    }

    /// Write a date (Unix ms, zone always zero).
    pub fn write_date(&mut self, unix_ms: i64) {
        self.w.write_u8(MARKER_DATE);
        self.w.write_f64(unix_ms as f64);
        self.w.write_u16(0);
    }

    /// Write an object, emitting a backreference if an equal object was
    /// already written in this message.
    pub fn write_object(&mut self, o: &AmfObject) -> Result<()> {
        if let Some(idx) = self.object_refs.iter().position(|prev| prev == o) {
            if idx <= 0xffff {
                self.w.write_u8(MARKER_REFERENCE);
                self.w.write_u16(idx as u16);
                return Ok(());
            }
        }
        self.w.write_u8(MARKER_OBJECT);
        self.object_refs.push(o.clone());
        for (key, v) in o.iter() {
            if key.is_empty() {
                continue;
            }
            self.w.write_string16(key.as_bytes())?;
            self.write_value(v)?;
        }
        self.w.write_string16(b"")?;
        self.w.write_u8(MARKER_OBJECT_END);
        Ok(())
    }

    /// Write one value in AMF3 under the `avmplus` escape marker.
    pub fn write_amf3(&mut self, v: &AmfValue) -> Result<()> {
        self.w.write_u8(MARKER_AVMPLUS);
        amf3::write_value(&mut self.w, &mut self.amf3, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &AmfValue) -> AmfValue {
        let mut w = Amf0Writer::new();
        w.write_value(v).unwrap();
        let bytes = w.into_bytes();
        let mut pr = PacketReader::new(&bytes);
        let mut r = Amf0Reader::new(&mut pr);
        let got = r.read_value().unwrap();
        assert_eq!(pr.remaining(), 0);
        got
    }

    #[test]
    fn scalar_roundtrips() {
        for v in [
            AmfValue::Null,
            AmfValue::Boolean(true),
            AmfValue::Number(-2.5),
            AmfValue::String("connect".into()),
            AmfValue::Date(1_700_000_000_000),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn object_roundtrip() {
        let mut o = AmfObject::new();
        o.set_string("level", "status");
        o.set_string("code", "NetConnection.Connect.Success");
        o.set_number("objectEncoding", 3.0);
        assert_eq!(roundtrip(&AmfValue::Object(o.clone())), AmfValue::Object(o));
    }

    #[test]
    fn typed_reads_accept_null() {
        let mut w = Amf0Writer::new();
        w.write_null();
        w.write_null();
        w.write_null();
        let bytes = w.into_bytes();
        let mut pr = PacketReader::new(&bytes);
        let mut r = Amf0Reader::new(&mut pr);
        assert_eq!(r.read_string().unwrap(), "");
        assert_eq!(r.read_number().unwrap(), 0.0);
        assert_eq!(r.read_object().unwrap(), None);
    }

    #[test]
    fn typed_reads_reject_other_markers() {
        let mut w = Amf0Writer::new();
        w.write_number(1.0);
        let bytes = w.into_bytes();
        let mut pr = PacketReader::new(&bytes);
        let mut r = Amf0Reader::new(&mut pr);
        assert!(matches!(
            r.read_string().unwrap_err(),
            AmfError::TypeMismatch { expected: "string", found: MARKER_NUMBER }
        ));
    }

    #[test]
    fn repeated_object_is_written_as_reference() {
        let mut o = AmfObject::new();
        o.set_number("n", 7.0);

        let mut w = Amf0Writer::new();
        w.write_object(&o).unwrap();
        let first = w.bytes().len();
        w.write_object(&o).unwrap();
        assert_eq!(w.bytes().len(), first + 3); // marker + u16 index

        let bytes = w.into_bytes();
        let mut pr = PacketReader::new(&bytes);
        let mut r = Amf0Reader::new(&mut pr);
        assert_eq!(r.read_value().unwrap(), AmfValue::Object(o.clone()));
        assert_eq!(r.read_value().unwrap(), AmfValue::Object(o));
    }

    #[test]
    fn avmplus_marker_switches_to_amf3() {
        let mut w = Amf0Writer::new();
        w.write_amf3(&AmfValue::Integer(300)).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], MARKER_AVMPLUS);

        let mut pr = PacketReader::new(&bytes);
        let mut r = Amf0Reader::new(&mut pr);
        assert_eq!(r.read_value().unwrap(), AmfValue::Integer(300));
    }

    #[test]
    fn undefined_decodes_to_null() {
        let bytes = [MARKER_UNDEFINED];
        let mut pr = PacketReader::new(&bytes);
        let mut r = Amf0Reader::new(&mut pr);
        assert_eq!(r.read_value().unwrap(), AmfValue::Null);
    }
}
