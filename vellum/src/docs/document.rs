//! Document and tombstone records.
//!
//! Documents compare case-insensitively for identity but preserve the
//! casing they were written with. The collection is read from the body's
//! `@metadata.Raven-Entity-Name` field; documents without one participate
//! only in the global etag feed.

#![allow(clippy::cast_possible_truncation)]

use std::time::{SystemTime, UNIX_EPOCH};

use crate::docs::data::{DataError, ObjectData};

/// Metadata field carried by document bodies.
pub const METADATA_FIELD: &str = "@metadata";

/// Metadata entry naming a document's collection.
pub const COLLECTION_FIELD: &str = "Raven-Entity-Name";

/// A stored document.
#[derive(Debug, Clone)]
pub struct Document {
    /// The key with its original casing.
    pub key: String,
    /// Version counter, unique and monotonic across the store.
    pub etag: u64,
    /// Milliseconds since the Unix epoch, stamped at write.
    pub last_modified: u64,
    /// Collection from the body metadata, if any.
    pub collection: Option<String>,
    /// The opaque body.
    pub data: ObjectData,
}

impl Document {
    /// Extract the collection name from a body's metadata.
    #[must_use]
    pub fn collection_of(data: &ObjectData) -> Option<String> {
        data.try_get(METADATA_FIELD)
            .and_then(|value| value.as_object())
            .and_then(|metadata| metadata.try_get(COLLECTION_FIELD))
            .and_then(|value| value.as_str().map(ToString::to_string))
    }

    /// Serialize to the `docs` tree record format.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let collection = self.collection.as_deref().unwrap_or_default();
        let mut bytes = Vec::with_capacity(
            8 + 8 + 2 + self.key.len() + 3 + collection.len() + 4 + self.data.size(),
        );
        bytes.extend_from_slice(&self.etag.to_le_bytes());
        bytes.extend_from_slice(&self.last_modified.to_le_bytes());
        bytes.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        bytes.extend_from_slice(self.key.as_bytes());
        bytes.push(u8::from(self.collection.is_some()));
        bytes.extend_from_slice(&(collection.len() as u16).to_le_bytes());
        bytes.extend_from_slice(collection.as_bytes());
        bytes.extend_from_slice(&(self.data.size() as u32).to_le_bytes());
        bytes.extend_from_slice(self.data.as_bytes());
        bytes
    }

    /// Parse a `docs` tree record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DataError> {
        let mut reader = Reader { bytes, offset: 0 };
        let etag = reader.u64()?;
        let last_modified = reader.u64()?;
        let key = reader.string16()?;
        let has_collection = reader.u8()? != 0;
        let collection_name = reader.string16()?;
        let data_len = reader.u32()? as usize;
        let data = ObjectData::from_bytes(reader.take(data_len)?.to_vec())?;
        if reader.offset != bytes.len() {
            return Err(DataError::Truncated);
        }
        Ok(Self {
            key,
            etag,
            last_modified,
            collection: has_collection.then_some(collection_name),
            data,
        })
    }
}

/// A record of a deleted document, kept for incremental consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// The deleted document's key, original casing.
    pub key: String,
    /// Etag assigned to the deletion itself.
    pub etag: u64,
    /// The etag the document had when it was deleted.
    pub deleted_etag: u64,
    /// The collection the document belonged to.
    pub collection: String,
}

impl Tombstone {
    /// Serialize to the tombstone tree record format.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(8 + 8 + 2 + self.key.len() + 2 + self.collection.len());
        bytes.extend_from_slice(&self.etag.to_le_bytes());
        bytes.extend_from_slice(&self.deleted_etag.to_le_bytes());
        bytes.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        bytes.extend_from_slice(self.key.as_bytes());
        bytes.extend_from_slice(&(self.collection.len() as u16).to_le_bytes());
        bytes.extend_from_slice(self.collection.as_bytes());
        bytes
    }

    /// Parse a tombstone tree record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DataError> {
        let mut reader = Reader { bytes, offset: 0 };
        let etag = reader.u64()?;
        let deleted_etag = reader.u64()?;
        let key = reader.string16()?;
        let collection = reader.string16()?;
        if reader.offset != bytes.len() {
            return Err(DataError::Truncated);
        }
        Ok(Self {
            key,
            etag,
            deleted_etag,
            collection,
        })
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DataError> {
        let slice = self
            .bytes
            .get(self.offset..self.offset + len)
            .ok_or(DataError::Truncated)?;
        self.offset += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DataError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DataError> {
        let slice = self.take(2)?;
        Ok(u16::from_le_bytes([slice[0], slice[1]]))
    }

    fn u32(&mut self) -> Result<u32, DataError> {
        let slice = self.take(4)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn u64(&mut self) -> Result<u64, DataError> {
        let slice = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        Ok(u64::from_le_bytes(buf))
    }

    fn string16(&mut self) -> Result<String, DataError> {
        let len = self.u16()? as usize;
        let slice = self.take(len)?;
        String::from_utf8(slice.to_vec()).map_err(|_| DataError::InvalidUtf8)
    }
}
