//! Message framing for the wire protocol.
//!
//! A frame is a length-prefixed fast header, a CBOR metadata block and an
//! opaque payload. [`FrameDecoder`] pulls complete frames out of a growing
//! read buffer and leaves partial frames in place.

use crate::header::{FastHeader, FAST_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default maximum frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum metadata size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fast header (24 bytes)
    pub fast: FastHeader,
    /// Metadata as raw CBOR bytes
    pub meta_raw: Bytes,
    /// Opaque payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(fast: FastHeader, meta_raw: Bytes, payload: Bytes) -> Self {
        Self {
            fast,
            meta_raw,
            payload,
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        4 + FAST_HEADER_SIZE + 4 + self.meta_raw.len() + self.payload.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size > max_frame_size.min(HARD_MAX_FRAME_SIZE) {
            return Err(crate::WireError::FrameTooLarge {
                size: total_size,
                limit: max_frame_size.min(HARD_MAX_FRAME_SIZE),
            });
        }
        if self.meta_raw.len() > MAX_META_SIZE {
            return Err(crate::WireError::InvalidMeta);
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        buf.put_u32((total_size - 4) as u32);
        self.fast.encode(&mut buf);
        buf.put_u32(self.meta_raw.len() as u32);
        buf.put_slice(&self.meta_raw);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder with the default size limit
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom size limit, clamped to the hard limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(crate::WireError::FrameTooLarge {
                size: frame_len,
                limit: self.max_frame_size,
            });
        }
        if frame_len < FAST_HEADER_SIZE + 4 {
            return Err(crate::WireError::Malformed);
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let fast = FastHeader::decode(&mut frame_buf)?;

        let meta_len = frame_buf.get_u32() as usize;
        if meta_len > MAX_META_SIZE || frame_buf.len() < meta_len {
            return Err(crate::WireError::InvalidMeta);
        }

        let meta_raw = frame_buf.split_to(meta_len);

        Ok(Some(Frame {
            fast,
            meta_raw,
            payload: frame_buf,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FrameType;

    fn sample_frame() -> Frame {
        Frame::new(
            FastHeader::new(FrameType::Data),
            Bytes::from_static(&[0xA0]),
            Bytes::from_static(b"payload"),
        )
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let encoded = sample_frame().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();

        let mut buf = BytesMut::from(&encoded[..10]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&encoded[10..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, sample_frame());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let encoded = sample_frame().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded);
        buf.extend_from_slice(&encoded);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_size_limits() {
        let frame = sample_frame();
        assert_eq!(
            frame.encode(16),
            Err(crate::WireError::FrameTooLarge {
                size: frame.encoded_size(),
                limit: 16
            })
        );

        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(crate::WireError::FrameTooLarge { limit: 8, .. })
        ));
    }

    #[test]
    fn test_short_length_prefix_is_malformed() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 1, 2, 3][..]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf), Err(crate::WireError::Malformed));
    }
}
