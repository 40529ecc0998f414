//! Self-describing binary document data.
//!
//! Documents are stored as an immutable, sized binary object the core never
//! interprets beyond `try_get`. A document is a flat list of named fields;
//! values are null, bool, i64, f64, UTF-8 string or a nested object. The
//! store itself only reads `@metadata.Raven-Entity-Name`.
//!
//! Layout: field count (u16), then per field: name length (u16), name
//! bytes, tag (u8), payload. String and object payloads carry a u32 byte
//! length. All integers little-endian.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_OBJECT: u8 = 5;

/// Nesting bound for validation.
const MAX_DEPTH: usize = 16;

/// An immutable document body.
#[derive(Clone)]
pub struct ObjectData {
    bytes: Arc<[u8]>,
}

impl ObjectData {
    /// Validate and wrap raw object bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DataError> {
        validate_object(&bytes, 0)?;
        Ok(Self {
            bytes: bytes.into(),
        })
    }

    /// The raw object bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The serialized size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Look up a top-level field by name.
    #[must_use]
    pub fn try_get(&self, name: &str) -> Option<Value<'_>> {
        ObjectView { bytes: &self.bytes }.try_get(name)
    }
}

impl std::fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectData")
            .field("size", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// A borrowed view over a (nested) object.
#[derive(Debug, Clone, Copy)]
pub struct ObjectView<'a> {
    bytes: &'a [u8],
}

impl<'a> ObjectView<'a> {
    /// Look up a field by name.
    #[must_use]
    pub fn try_get(&self, name: &str) -> Option<Value<'a>> {
        let mut offset = 2usize;
        let count = read_u16(self.bytes, 0)? as usize;
        for _ in 0..count {
            let name_len = read_u16(self.bytes, offset)? as usize;
            offset += 2;
            let field_name = self.bytes.get(offset..offset + name_len)?;
            offset += name_len;
            let tag = *self.bytes.get(offset)?;
            offset += 1;

            let payload_len = payload_length(self.bytes, offset, tag)?;
            if field_name == name.as_bytes() {
                return decode_value(self.bytes, offset, tag);
            }
            offset += payload_len;
        }
        None
    }
}

/// A decoded field value.
#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(&'a str),
    Object(ObjectView<'a>),
}

impl<'a> Value<'a> {
    /// The string payload, if this is a string value.
    #[must_use]
    pub const fn as_str(&self) -> Option<&'a str> {
        match *self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The nested object, if this is an object value.
    #[must_use]
    pub const fn as_object(&self) -> Option<ObjectView<'a>> {
        match *self {
            Self::Object(view) => Some(view),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer value.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match *self {
            Self::Int(value) => Some(value),
            _ => None,
        }
    }

    /// The boolean payload, if this is a boolean value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(value) => Some(value),
            _ => None,
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let slice = bytes.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Payload length for a tag at `offset`, including length prefixes.
fn payload_length(bytes: &[u8], offset: usize, tag: u8) -> Option<usize> {
    match tag {
        TAG_NULL => Some(0),
        TAG_BOOL => Some(1),
        TAG_INT | TAG_FLOAT => Some(8),
        TAG_STRING | TAG_OBJECT => Some(4 + read_u32(bytes, offset)? as usize),
        _ => None,
    }
}

fn decode_value(bytes: &[u8], offset: usize, tag: u8) -> Option<Value<'_>> {
    match tag {
        TAG_NULL => Some(Value::Null),
        TAG_BOOL => Some(Value::Bool(*bytes.get(offset)? != 0)),
        TAG_INT => {
            let slice = bytes.get(offset..offset + 8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slice);
            Some(Value::Int(i64::from_le_bytes(buf)))
        }
        TAG_FLOAT => {
            let slice = bytes.get(offset..offset + 8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slice);
            Some(Value::Float(f64::from_le_bytes(buf)))
        }
        TAG_STRING => {
            let len = read_u32(bytes, offset)? as usize;
            let slice = bytes.get(offset + 4..offset + 4 + len)?;
            std::str::from_utf8(slice).ok().map(Value::Str)
        }
        TAG_OBJECT => {
            let len = read_u32(bytes, offset)? as usize;
            let slice = bytes.get(offset + 4..offset + 4 + len)?;
            Some(Value::Object(ObjectView { bytes: slice }))
        }
        _ => None,
    }
}

fn validate_object(bytes: &[u8], depth: usize) -> Result<(), DataError> {
    if depth > MAX_DEPTH {
        return Err(DataError::TooDeep);
    }
    let count = read_u16(bytes, 0).ok_or(DataError::Truncated)? as usize;
    let mut offset = 2usize;
    for _ in 0..count {
        let name_len = read_u16(bytes, offset).ok_or(DataError::Truncated)? as usize;
        offset += 2;
        let name = bytes
            .get(offset..offset + name_len)
            .ok_or(DataError::Truncated)?;
        std::str::from_utf8(name).map_err(|_| DataError::InvalidUtf8)?;
        offset += name_len;
        let tag = *bytes.get(offset).ok_or(DataError::Truncated)?;
        offset += 1;
        let payload_len =
            payload_length(bytes, offset, tag).ok_or(DataError::UnknownTag(tag))?;
        let payload = bytes
            .get(offset..offset + payload_len)
            .ok_or(DataError::Truncated)?;
        match tag {
            TAG_STRING => {
                std::str::from_utf8(&payload[4..]).map_err(|_| DataError::InvalidUtf8)?;
            }
            TAG_OBJECT => validate_object(&payload[4..], depth + 1)?,
            _ => {}
        }
        offset += payload_len;
    }
    if offset != bytes.len() {
        return Err(DataError::Truncated);
    }
    Ok(())
}

/// Builder for [`ObjectData`].
#[derive(Debug, Default)]
pub struct ObjectBuilder {
    fields: Vec<(String, OwnedValue)>,
}

#[derive(Debug)]
enum OwnedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(Vec<u8>),
}

impl ObjectBuilder {
    /// A builder with no fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a null field.
    #[must_use]
    pub fn with_null(mut self, name: &str) -> Self {
        self.fields.push((name.to_string(), OwnedValue::Null));
        self
    }

    /// Add a boolean field.
    #[must_use]
    pub fn with_bool(mut self, name: &str, value: bool) -> Self {
        self.fields.push((name.to_string(), OwnedValue::Bool(value)));
        self
    }

    /// Add an integer field.
    #[must_use]
    pub fn with_int(mut self, name: &str, value: i64) -> Self {
        self.fields.push((name.to_string(), OwnedValue::Int(value)));
        self
    }

    /// Add a float field.
    #[must_use]
    pub fn with_float(mut self, name: &str, value: f64) -> Self {
        self.fields.push((name.to_string(), OwnedValue::Float(value)));
        self
    }

    /// Add a string field.
    #[must_use]
    pub fn with_string(mut self, name: &str, value: &str) -> Self {
        self.fields
            .push((name.to_string(), OwnedValue::Str(value.to_string())));
        self
    }

    /// Add a nested object field.
    #[must_use]
    pub fn with_object(mut self, name: &str, nested: Self) -> Self {
        self.fields
            .push((name.to_string(), OwnedValue::Object(nested.encode())));
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for (name, value) in &self.fields {
            bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
            bytes.extend_from_slice(name.as_bytes());
            match value {
                OwnedValue::Null => bytes.push(TAG_NULL),
                OwnedValue::Bool(v) => {
                    bytes.push(TAG_BOOL);
                    bytes.push(u8::from(*v));
                }
                OwnedValue::Int(v) => {
                    bytes.push(TAG_INT);
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                OwnedValue::Float(v) => {
                    bytes.push(TAG_FLOAT);
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                OwnedValue::Str(v) => {
                    bytes.push(TAG_STRING);
                    bytes.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    bytes.extend_from_slice(v.as_bytes());
                }
                OwnedValue::Object(v) => {
                    bytes.push(TAG_OBJECT);
                    bytes.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    bytes.extend_from_slice(v);
                }
            }
        }
        bytes
    }

    /// Finish into an immutable object.
    #[must_use]
    pub fn build(self) -> ObjectData {
        ObjectData {
            bytes: self.encode().into(),
        }
    }
}

/// Errors raised while validating object bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum DataError {
    /// A length field points past the end of the data.
    Truncated,
    /// Unknown value tag.
    UnknownTag(u8),
    /// A name or string payload is not valid UTF-8.
    InvalidUtf8,
    /// Objects nest deeper than the bound.
    TooDeep,
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "object data is truncated"),
            Self::UnknownTag(tag) => write!(f, "unknown value tag: 0x{tag:02x}"),
            Self::InvalidUtf8 => write!(f, "object data holds invalid UTF-8"),
            Self::TooDeep => write!(f, "object nesting exceeds the depth bound"),
        }
    }
}

impl std::error::Error for DataError {}
