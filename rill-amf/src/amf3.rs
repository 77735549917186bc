//! AMF3 codec.
//!
//! AMF3 threads three reference tables through a message: strings,
//! objects (also dates and byte arrays), and traits (the ordered field
//! lists of previously seen objects). The tables live in
//! [`ReadTables`]/[`WriteTables`] so the AMF0 codec can share them when a
//! message switches encodings mid-stream (marker `0x11`).

use rill_wire::{PacketReader, PacketWriter};

use crate::{AmfError, AmfObject, AmfValue, Result};

// ─── Markers ─────────────────────────────────────────────────────────────────

pub(crate) const MARKER_UNDEFINED: u8 = 0x00;
pub(crate) const MARKER_NULL: u8 = 0x01;
pub(crate) const MARKER_FALSE: u8 = 0x02;
pub(crate) const MARKER_TRUE: u8 = 0x03;
pub(crate) const MARKER_INTEGER: u8 = 0x04;
pub(crate) const MARKER_NUMBER: u8 = 0x05;
pub(crate) const MARKER_STRING: u8 = 0x06;
pub(crate) const MARKER_DATE: u8 = 0x08;
pub(crate) const MARKER_OBJECT: u8 = 0x0a;
pub(crate) const MARKER_BYTE_ARRAY: u8 = 0x0c;

/// Largest encodable AMF3 integer.
pub const MAX_INT: i32 = (1 << 28) - 1;
/// Smallest encodable AMF3 integer.
pub const MIN_INT: i32 = -(1 << 28);

// ─── Reference tables ────────────────────────────────────────────────────────

/// Decoder-side reference tables, fresh per message.
#[derive(Default)]
pub struct ReadTables {
    strings: Vec<String>,
    objects: Vec<AmfValue>,
    traits: Vec<Vec<String>>,
}

/// Encoder-side reference tables, fresh per message.
///
/// Dates and byte arrays occupy object-reference slots but are never
/// re-referenced by the encoder, so they sit in the table as `None`.
#[derive(Default)]
pub struct WriteTables {
    objects: Vec<Option<AmfObject>>,
    traits: Vec<Vec<String>>,
}

// ─── Decoding ────────────────────────────────────────────────────────────────

fn marker(r: &mut PacketReader<'_>) -> Result<u8> {
    r.read_u8().map_err(|_| AmfError::UnexpectedEof)
}

/// Read one AMF3 value.
pub(crate) fn read_value(r: &mut PacketReader<'_>, t: &mut ReadTables) -> Result<AmfValue> {
    match marker(r)? {
        MARKER_UNDEFINED | MARKER_NULL => Ok(AmfValue::Null),
        MARKER_FALSE => Ok(AmfValue::Boolean(false)),
        MARKER_TRUE => Ok(AmfValue::Boolean(true)),
        MARKER_INTEGER => Ok(AmfValue::Integer(read_integer_value(r)?)),
        MARKER_NUMBER => Ok(AmfValue::Number(r.read_f64()?)),
        MARKER_STRING => Ok(AmfValue::String(read_string_value(r, t)?)),
        MARKER_DATE => Ok(AmfValue::Date(read_date_value(r, t)?)),
        MARKER_OBJECT => Ok(AmfValue::Object(read_object_value(r, t)?)),
        MARKER_BYTE_ARRAY => Ok(AmfValue::ByteArray(read_byte_array_value(r, t)?)),
        m => Err(AmfError::UnsupportedMarker(m)),
    }
}

fn read_integer_value(r: &mut PacketReader<'_>) -> Result<i32> {
    let v = r.read_7bit_u32()?;
    if v & (1 << 28) == 0 {
        Ok(v as i32)
    } else {
        // Sign-extend the 29-bit value.
        Ok((v | 0xe000_0000) as i32)
    }
}

fn read_string_value(r: &mut PacketReader<'_>, t: &mut ReadTables) -> Result<String> {
    let head = r.read_7bit_u32()?;
    if head & 0x01 == 0 {
        let idx = (head >> 1) as usize;
        return t.strings.get(idx).cloned().ok_or(AmfError::BadReference(idx));
    }
    let len = (head >> 1) as usize;
    if len == 0 {
        return Ok(String::new());
    }
    let bytes = r.read_vec(len)?;
    let s = String::from_utf8_lossy(&bytes).into_owned();
    t.strings.push(s.clone());
    Ok(s)
}

fn read_date_value(r: &mut PacketReader<'_>, t: &mut ReadTables) -> Result<i64> {
    let head = r.read_7bit_u32()?;
    if head & 0x01 == 0 {
        let idx = (head >> 1) as usize;
        return match t.objects.get(idx) {
            Some(AmfValue::Date(ms)) => Ok(*ms),
            Some(_) => Err(AmfError::WrongReferenceKind("date")),
            None => Err(AmfError::BadReference(idx)),
        };
    }
    let ms = r.read_f64()? as i64;
    t.objects.push(AmfValue::Date(ms));
    Ok(ms)
}

fn read_byte_array_value(r: &mut PacketReader<'_>, t: &mut ReadTables) -> Result<Vec<u8>> {
    let head = r.read_7bit_u32()?;
    if head & 0x01 == 0 {
        let idx = (head >> 1) as usize;
        return match t.objects.get(idx) {
            Some(AmfValue::ByteArray(b)) => Ok(b.clone()),
            Some(_) => Err(AmfError::WrongReferenceKind("byte array")),
            None => Err(AmfError::BadReference(idx)),
        };
    }
    let buf = r.read_vec((head >> 1) as usize)?;
    t.objects.push(AmfValue::ByteArray(buf.clone()));
    Ok(buf)
}

fn read_object_value(r: &mut PacketReader<'_>, t: &mut ReadTables) -> Result<AmfObject> {
    let head = r.read_7bit_u32()?;
    if head & 0x01 == 0 {
        let idx = (head >> 1) as usize;
        return match t.objects.get(idx) {
            Some(AmfValue::Object(o)) => Ok(o.clone()),
            Some(_) => Err(AmfError::WrongReferenceKind("object")),
            None => Err(AmfError::BadReference(idx)),
        };
    }
    let fields = load_traits(r, t, head)?;

    // Reserve the reference slot before reading fields so nested indices
    // line up with the encoder's table.
    let slot = t.objects.len();
    t.objects.push(AmfValue::Null);

    let mut o = AmfObject::new();
    for name in &fields {
        let v = read_value(r, t)?;
        o.set(name.clone(), v);
    }
    t.objects[slot] = AmfValue::Object(o.clone());
    Ok(o)
}

fn load_traits(r: &mut PacketReader<'_>, t: &mut ReadTables, head: u32) -> Result<Vec<String>> {
    if head & 0x03 == 0x01 {
        let idx = (head >> 2) as usize;
        return t.traits.get(idx).cloned().ok_or(AmfError::BadReference(idx));
    }
    if head & 0x0f != 0x03 {
        return Err(AmfError::UnsupportedMarker((head & 0x0f) as u8));
    }
    // Class name — always anonymous here, read and ignore.
    read_string_value(r, t)?;
    let n = (head >> 4) as usize;
    let mut fields = Vec::with_capacity(n);
    for _ in 0..n {
        fields.push(read_string_value(r, t)?);
    }
    t.traits.push(fields.clone());
    Ok(fields)
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Write one AMF3 value.
pub(crate) fn write_value(w: &mut PacketWriter, t: &mut WriteTables, v: &AmfValue) -> Result<()> {
    match v {
        AmfValue::Null => {
            w.write_u8(MARKER_NULL);
            Ok(())
        }
        AmfValue::Boolean(b) => {
            w.write_u8(if *b { MARKER_TRUE } else { MARKER_FALSE });
            Ok(())
        }
        AmfValue::Integer(i) => write_integer(w, *i),
        AmfValue::Number(n) => {
            w.write_u8(MARKER_NUMBER);
            w.write_f64(*n);
            Ok(())
        }
        AmfValue::String(s) => {
            w.write_u8(MARKER_STRING);
            write_string_value(w, s.as_bytes())
        }
        AmfValue::Date(ms) => {
            w.write_u8(MARKER_DATE);
            // Dates occupy an object-reference slot even when inlined.
            t.objects.push(None);
            w.write_7bit_u32(0x01)?;
            w.write_f64(*ms as f64);
            Ok(())
        }
        AmfValue::Object(o) => {
            w.write_u8(MARKER_OBJECT);
            write_object_value(w, t, o)
        }
        AmfValue::ByteArray(b) => {
            w.write_u8(MARKER_BYTE_ARRAY);
            t.objects.push(None);
            w.write_7bit_u32(((b.len() as u32) << 1) | 0x01)?;
            w.write_bytes(b);
            Ok(())
        }
    }
}

fn write_integer(w: &mut PacketWriter, v: i32) -> Result<()> {
    if !(MIN_INT..=MAX_INT).contains(&v) {
        return Err(AmfError::IntegerRange);
    }
    w.write_u8(MARKER_INTEGER);
    w.write_7bit_u32((v as u32) & 0x1fff_ffff)?;
    Ok(())
}

/// The inline string form: `len << 1 | 1` then the raw bytes.
/// The empty string is the bare head `0x01`.
fn write_string_value(w: &mut PacketWriter, s: &[u8]) -> Result<()> {
    if s.is_empty() {
        w.write_7bit_u32(0x01)?;
        return Ok(());
    }
    w.write_7bit_u32(((s.len() as u32) << 1) | 0x01)?;
    w.write_bytes(s);
    Ok(())
}

fn write_object_value(w: &mut PacketWriter, t: &mut WriteTables, o: &AmfObject) -> Result<()> {
    if let Some(idx) = t.objects.iter().position(|prev| prev.as_ref() == Some(o)) {
        w.write_7bit_u32((idx as u32) << 1)?;
        return Ok(());
    }
    t.objects.push(Some(o.clone()));

    let fields = o.field_names();
    if let Some(idx) = t.traits.iter().position(|prev| *prev == fields) {
        w.write_7bit_u32(((idx as u32) << 2) | 0x01)?;
    } else {
        t.traits.push(fields.clone());
        w.write_7bit_u32(((fields.len() as u32) << 4) | 0x03)?;
        // Anonymous class name.
        write_string_value(w, b"")?;
        for name in &fields {
            write_string_value(w, name.as_bytes())?;
        }
    }
    for name in &fields {
        let v = o.get(name).expect("field listed but missing");
        write_value(w, t, v)?;
    }
    Ok(())
}

// ─── Standalone reader / writer ──────────────────────────────────────────────

/// An AMF3 decoder over a packet reader.
pub struct Amf3Reader<'a, 'r> {
    r: &'r mut PacketReader<'a>,
    tables: ReadTables,
}

impl<'a, 'r> Amf3Reader<'a, 'r> {
    /// Wrap a packet reader; reference tables start empty.
    pub fn new(r: &'r mut PacketReader<'a>) -> Self {
        Self { r, tables: ReadTables::default() }
    }

    /// Read the next value.
    pub fn read_value(&mut self) -> Result<AmfValue> {
        read_value(self.r, &mut self.tables)
    }
}

/// An AMF3 encoder producing a byte buffer.
#[derive(Default)]
pub struct Amf3Writer {
    w: PacketWriter,
    tables: WriteTables,
}

impl Amf3Writer {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one value.
    pub fn write_value(&mut self, v: &AmfValue) -> Result<()> {
        write_value(&mut self.w, &mut self.tables, v)
    }

    /// The encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        self.w.bytes()
    }

    /// Consume the encoder, yielding the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.w.into_bytes()
    }
}
