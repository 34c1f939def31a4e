//! Encoding and decoding for the wire protocol.
//!
//! This module provides the frame builder, CBOR metadata helpers and the
//! optional header checksum check.

use crate::frame::Frame;
use crate::header::{crc32_fast_header, FastHeader, Flags};
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// Metadata key holding the header checksum
const HDR_CSUM_KEY: &str = "hdr_csum";

/// CBOR metadata builder helper
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert a u32 value
    pub fn insert_u32(mut self, key: &str, value: u32) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert a boolean value
    pub fn insert_bool(mut self, key: &str, value: bool) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bool(value));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

/// Frame builder for constructing wire frames
#[derive(Debug)]
pub struct FrameBuilder {
    fast: FastHeader,
    meta: MetaBuilder,
    payload: Bytes,
}

impl FrameBuilder {
    /// Create a new frame builder
    pub fn new(fast: FastHeader) -> Self {
        Self {
            fast,
            meta: MetaBuilder::new(),
            payload: Bytes::new(),
        }
    }

    /// Set additional flags
    pub fn flags(mut self, flags: Flags) -> Self {
        self.fast.flags |= flags;
        self
    }

    /// Insert string metadata
    pub fn meta_insert_str(mut self, key: &str, value: &str) -> Self {
        self.meta = self.meta.insert_str(key, value);
        self
    }

    /// Insert u32 metadata
    pub fn meta_insert_u32(mut self, key: &str, value: u32) -> Self {
        self.meta = self.meta.insert_u32(key, value);
        self
    }

    /// Insert boolean metadata
    pub fn meta_insert_bool(mut self, key: &str, value: bool) -> Self {
        self.meta = self.meta.insert_bool(key, value);
        self
    }

    /// Set payload
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Build and encode the frame
    pub fn build(mut self, max_frame: usize) -> Result<Bytes, CodecError> {
        if self.fast.flags.contains(Flags::HDR_CHECKSUM) {
            let checksum = crc32_fast_header(&self.fast);
            self.meta = self.meta.insert_u32(HDR_CSUM_KEY, checksum);
        }

        let meta_raw = self.meta.build()?;
        let frame = Frame::new(self.fast, meta_raw, self.payload);

        frame.encode(max_frame).map_err(CodecError::Wire)
    }
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Metadata decoding error
    #[error("metadata decoding failed")]
    MetaDecode,
}

/// Parse CBOR metadata into a map.
///
/// An empty metadata block parses to an empty map.
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    if meta_raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| CodecError::MetaDecode)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(CodecError::MetaDecode)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    match meta.get(key) {
        Some(ciborium::Value::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Get u32 value from metadata
pub fn get_meta_u32(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u32> {
    match meta.get(key) {
        Some(ciborium::Value::Integer(i)) => (*i).try_into().ok(),
        _ => None,
    }
}

/// Get boolean value from metadata
pub fn get_meta_bool(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<bool> {
    match meta.get(key) {
        Some(ciborium::Value::Bool(b)) => Some(*b),
        _ => None,
    }
}

/// Verify the header checksum of a decoded frame.
///
/// Frames without [`Flags::HDR_CHECKSUM`] pass unconditionally.
pub fn verify_header_checksum(frame: &Frame) -> Result<(), CodecError> {
    if !frame.fast.flags.contains(Flags::HDR_CHECKSUM) {
        return Ok(());
    }

    let meta = parse_meta(&frame.meta_raw)?;
    let expected = get_meta_u32(&meta, HDR_CSUM_KEY).ok_or(CodecError::MetaDecode)?;
    if crc32_fast_header(&frame.fast) != expected {
        return Err(CodecError::Wire(crate::WireError::ChecksumMismatch));
    }
    Ok(())
}
