// Typed per-message properties with the strict scalar coercion matrix:
// numeric reads widen losslessly, any scalar reads as a string, a stored
// string parses on numeric reads, and byte sequences and null convert to
// nothing. A null value is present-but-valueless, distinct from absent.
use bytes::Bytes;
use std::collections::HashMap;

use crate::{MessageError, Result};

/// One tagged property value. A name maps to exactly one tag; `put`
/// replaces the previous value and its tag.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bytes(Bytes),
    Null,
}

impl PropertyValue {
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Byte(_) => "byte",
            PropertyValue::Short(_) => "short",
            PropertyValue::Int(_) => "int",
            PropertyValue::Long(_) => "long",
            PropertyValue::Float(_) => "float",
            PropertyValue::Double(_) => "double",
            PropertyValue::Str(_) => "string",
            PropertyValue::Bytes(_) => "bytes",
            PropertyValue::Null => "null",
        }
    }
}

/// Typed key/value store attached to each message.
///
/// ```
/// use courier_message::{PropertyStore, PropertyValue};
///
/// let mut props = PropertyStore::new();
/// props.put("count", PropertyValue::Int(5));
/// assert_eq!(props.get_string("count").expect("convert"), Some("5".to_string()));
/// assert_eq!(props.get_long("count").expect("widen"), Some(5));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyStore {
    entries: HashMap<String, PropertyValue>,
}

// Shorthand for the conversion failure every mismatched accessor reports.
fn conversion(name: &str, stored: &'static str, requested: &'static str) -> MessageError {
    MessageError::TypeConversion {
        name: name.to_string(),
        stored,
        requested,
    }
}

fn parse<T: std::str::FromStr>(
    name: &str,
    text: &str,
    requested: &'static str,
) -> Result<T> {
    text.parse::<T>()
        .map_err(|_| conversion(name, "string", requested))
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing value for `name`, fixing its tag.
    pub fn put(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.entries.remove(name)
    }

    /// True for every stored name, including names stored as null.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw tagged value; `None` when the name is absent.
    pub fn get_object(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.get(name)
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Bool(v)) => Ok(Some(*v)),
            Some(PropertyValue::Str(s)) => match s.as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(conversion(name, "string", "boolean")),
            },
            Some(other) => Err(conversion(name, other.kind(), "boolean")),
        }
    }

    pub fn get_byte(&self, name: &str) -> Result<Option<i8>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Byte(v)) => Ok(Some(*v)),
            Some(PropertyValue::Str(s)) => parse(name, s, "byte").map(Some),
            Some(other) => Err(conversion(name, other.kind(), "byte")),
        }
    }

    pub fn get_short(&self, name: &str) -> Result<Option<i16>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Byte(v)) => Ok(Some(i16::from(*v))),
            Some(PropertyValue::Short(v)) => Ok(Some(*v)),
            Some(PropertyValue::Str(s)) => parse(name, s, "short").map(Some),
            Some(other) => Err(conversion(name, other.kind(), "short")),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<Option<i32>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Byte(v)) => Ok(Some(i32::from(*v))),
            Some(PropertyValue::Short(v)) => Ok(Some(i32::from(*v))),
            Some(PropertyValue::Int(v)) => Ok(Some(*v)),
            Some(PropertyValue::Str(s)) => parse(name, s, "int").map(Some),
            Some(other) => Err(conversion(name, other.kind(), "int")),
        }
    }

    pub fn get_long(&self, name: &str) -> Result<Option<i64>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Byte(v)) => Ok(Some(i64::from(*v))),
            Some(PropertyValue::Short(v)) => Ok(Some(i64::from(*v))),
            Some(PropertyValue::Int(v)) => Ok(Some(i64::from(*v))),
            Some(PropertyValue::Long(v)) => Ok(Some(*v)),
            Some(PropertyValue::Str(s)) => parse(name, s, "long").map(Some),
            Some(other) => Err(conversion(name, other.kind(), "long")),
        }
    }

    pub fn get_float(&self, name: &str) -> Result<Option<f32>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Float(v)) => Ok(Some(*v)),
            Some(PropertyValue::Str(s)) => parse(name, s, "float").map(Some),
            Some(other) => Err(conversion(name, other.kind(), "float")),
        }
    }

    pub fn get_double(&self, name: &str) -> Result<Option<f64>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Float(v)) => Ok(Some(f64::from(*v))),
            Some(PropertyValue::Double(v)) => Ok(Some(*v)),
            Some(PropertyValue::Str(s)) => parse(name, s, "double").map(Some),
            Some(other) => Err(conversion(name, other.kind(), "double")),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<Option<String>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Bool(v)) => Ok(Some(v.to_string())),
            Some(PropertyValue::Byte(v)) => Ok(Some(v.to_string())),
            Some(PropertyValue::Short(v)) => Ok(Some(v.to_string())),
            Some(PropertyValue::Int(v)) => Ok(Some(v.to_string())),
            Some(PropertyValue::Long(v)) => Ok(Some(v.to_string())),
            Some(PropertyValue::Float(v)) => Ok(Some(v.to_string())),
            Some(PropertyValue::Double(v)) => Ok(Some(v.to_string())),
            Some(PropertyValue::Str(v)) => Ok(Some(v.clone())),
            Some(PropertyValue::Bytes(_)) => Err(conversion(name, "bytes", "string")),
        }
    }

    pub fn get_bytes(&self, name: &str) -> Result<Option<Bytes>> {
        match self.entries.get(name) {
            None | Some(PropertyValue::Null) => Ok(None),
            Some(PropertyValue::Bytes(v)) => Ok(Some(v.clone())),
            Some(other) => Err(conversion(name, other.kind(), "bytes")),
        }
    }
}
