//! The dynamic AMF value model.

use indexmap::IndexMap;

/// A single AMF value of either encoding version.
#[derive(Clone, Debug, PartialEq)]
pub enum AmfValue {
    /// AMF null (the undefined marker also decodes to this).
    Null,
    /// Boolean.
    Boolean(bool),
    /// AMF3 29-bit integer.
    Integer(i32),
    /// IEEE-754 double.
    Number(f64),
    /// Text (decoded lossily — the wire does not promise UTF-8).
    String(String),
    /// AMF3 byte array.
    ByteArray(Vec<u8>),
    /// Anonymous object.
    Object(AmfObject),
    /// Unix milliseconds, UTC.
    Date(i64),
}

/// An anonymous AMF object: an insertion-ordered map of field → value.
///
/// Field order is significant on the wire; [`AmfObject`] preserves the
/// order fields were set in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AmfObject {
    values: IndexMap<String, AmfValue>,
}

impl AmfObject {
    /// Create an empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the object has no fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AmfValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The field names in insertion order.
    pub fn field_names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Set a field (replacing keeps the original position).
    pub fn set(&mut self, field: impl Into<String>, v: AmfValue) {
        self.values.insert(field.into(), v);
    }

    /// Set a field to null.
    pub fn set_null(&mut self, field: impl Into<String>) {
        self.set(field, AmfValue::Null);
    }

    /// Set a boolean field.
    pub fn set_boolean(&mut self, field: impl Into<String>, v: bool) {
        self.set(field, AmfValue::Boolean(v));
    }

    /// Set an integer field.
    pub fn set_integer(&mut self, field: impl Into<String>, v: i32) {
        self.set(field, AmfValue::Integer(v));
    }

    /// Set a number field.
    pub fn set_number(&mut self, field: impl Into<String>, v: f64) {
        self.set(field, AmfValue::Number(v));
    }

    /// Set a string field.
    pub fn set_string(&mut self, field: impl Into<String>, v: impl Into<String>) {
        self.set(field, AmfValue::String(v.into()));
    }

    /// Set a date field (Unix ms, UTC).
    pub fn set_date(&mut self, field: impl Into<String>, unix_ms: i64) {
        self.set(field, AmfValue::Date(unix_ms));
    }

    /// Set a nested object field.
    pub fn set_object(&mut self, field: impl Into<String>, v: AmfObject) {
        self.set(field, AmfValue::Object(v));
    }

    /// Set a byte-array field.
    pub fn set_byte_array(&mut self, field: impl Into<String>, v: Vec<u8>) {
        self.set(field, AmfValue::ByteArray(v));
    }

    /// Get a field.
    pub fn get(&self, field: &str) -> Option<&AmfValue> {
        self.values.get(field)
    }

    /// True if the field exists.
    pub fn has(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    /// Get a boolean field, if present and a boolean.
    pub fn get_boolean(&self, field: &str) -> Option<bool> {
        match self.get(field) {
            Some(AmfValue::Boolean(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a number field, if present and a number.
    pub fn get_number(&self, field: &str) -> Option<f64> {
        match self.get(field) {
            Some(AmfValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get an integer field, if present and an integer.
    pub fn get_integer(&self, field: &str) -> Option<i32> {
        match self.get(field) {
            Some(AmfValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a string field, if present and a string.
    pub fn get_string(&self, field: &str) -> Option<&str> {
        match self.get(field) {
            Some(AmfValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Get a nested object field, if present and an object.
    pub fn get_object(&self, field: &str) -> Option<&AmfObject> {
        match self.get(field) {
            Some(AmfValue::Object(v)) => Some(v),
            _ => None,
        }
    }

    /// Get a date field (Unix ms), if present and a date.
    pub fn get_date(&self, field: &str) -> Option<i64> {
        match self.get(field) {
            Some(AmfValue::Date(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a byte-array field, if present and a byte array.
    pub fn get_byte_array(&self, field: &str) -> Option<&[u8]> {
        match self.get(field) {
            Some(AmfValue::ByteArray(v)) => Some(v.as_slice()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_keep_insertion_order() {
        let mut o = AmfObject::new();
        o.set_string("zeta", "1");
        o.set_number("alpha", 2.0);
        o.set_boolean("mid", true);
        let names: Vec<_> = o.iter().map(|(k, _)| k.to_owned()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn replacing_keeps_position() {
        let mut o = AmfObject::new();
        o.set_number("a", 1.0);
        o.set_number("b", 2.0);
        o.set_number("a", 3.0);
        let names: Vec<_> = o.iter().map(|(k, _)| k.to_owned()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(o.get_number("a"), Some(3.0));
    }

    #[test]
    fn typed_getters_reject_other_kinds() {
        let mut o = AmfObject::new();
        o.set_string("s", "x");
        assert_eq!(o.get_number("s"), None);
        assert_eq!(o.get_string("s"), Some("x"));
        assert!(!o.has("missing"));
    }
}
