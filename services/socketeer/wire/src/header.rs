//! Fast header processing for the wire protocol.
//!
//! Every frame starts with a fixed 24-byte header carrying the frame type,
//! flags, a status code (used by REJECT frames) and two identifiers: the
//! message id of DATA frames and the correlation id of PING/PONG exchanges.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fast header size in bytes
pub const FAST_HEADER_SIZE: usize = 24;

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Opaque application payload
    Data = 0x00,
    /// Liveness probe
    Ping = 0x01,
    /// Liveness probe answer
    Pong = 0x02,
    /// Handshake request for a brand-new session
    Hello = 0x03,
    /// Handshake request resuming an existing session
    Resume = 0x04,
    /// Handshake accepted
    Welcome = 0x05,
    /// Handshake rejected, status code carries the reason
    Reject = 0x06,
    /// Graceful close
    Bye = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Ping),
            0x02 => Ok(FrameType::Pong),
            0x03 => Ok(FrameType::Hello),
            0x04 => Ok(FrameType::Resume),
            0x05 => Ok(FrameType::Welcome),
            0x06 => Ok(FrameType::Reject),
            0x07 => Ok(FrameType::Bye),
            _ => Err(crate::WireError::UnknownFrameType(value)),
        }
    }
}

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Meta has "hdr_csum" u32 covering the encoded fast header
        const HDR_CHECKSUM = 1 << 0;
        /// BYE asks for the bound session to be discarded instead of kept resumable
        const END_SESSION = 1 << 1;
    }
}

/// Status codes carried by REJECT frames and close notifications
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// No handshake request arrived in time
    HandshakeTimeout = 1,
    /// Unexpected or malformed frame
    ProtocolViolation = 2,
    /// Resume requested but the server does not support resuming
    ResumingNotSupported = 3,
    /// Unknown session id
    SessionNotFound = 4,
    /// Session idle for longer than the maximum session age
    SessionExpired = 5,
    /// Session is owned by another live connection
    SessionAlreadyBound = 6,
    /// Resume attempted from a different address than the session origin
    IpMismatch = 7,
    /// Peer stopped answering pings
    HeartbeatTimeout = 8,
}

impl TryFrom<u8> for StatusCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::HandshakeTimeout),
            2 => Ok(StatusCode::ProtocolViolation),
            3 => Ok(StatusCode::ResumingNotSupported),
            4 => Ok(StatusCode::SessionNotFound),
            5 => Ok(StatusCode::SessionExpired),
            6 => Ok(StatusCode::SessionAlreadyBound),
            7 => Ok(StatusCode::IpMismatch),
            8 => Ok(StatusCode::HeartbeatTimeout),
            _ => Err(crate::WireError::UnknownStatusCode(value)),
        }
    }
}

/// Fast header structure (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastHeader {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Frame type
    pub typ: FrameType,
    /// Frame flags
    pub flags: Flags,
    /// Status code for control frames
    pub code: StatusCode,
    /// Reserved field (must be zero)
    pub reserved0: u8,
    /// Reserved field (must be zero)
    pub reserved1: u16,
    /// Message id for DATA frames (0 if none)
    pub msg_id: u64,
    /// Correlation id for PING/PONG (0 if none)
    pub corr_id: u64,
}

impl FastHeader {
    /// Create a new fast header with default values
    pub fn new(typ: FrameType) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            flags: Flags::empty(),
            code: StatusCode::Ok,
            reserved0: 0,
            reserved1: 0,
            msg_id: 0,
            corr_id: 0,
        }
    }

    /// Set the correlation id
    pub fn with_corr_id(mut self, corr_id: u64) -> Self {
        self.corr_id = corr_id;
        self
    }

    /// Set the status code
    pub fn with_code(mut self, code: StatusCode) -> Self {
        self.code = code;
        self
    }

    /// Encode the fast header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.code as u8);
        buf.put_u8(self.reserved0);
        buf.put_u16(self.reserved1);
        buf.put_u64(self.msg_id);
        buf.put_u64(self.corr_id);
    }

    /// Decode the fast header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < FAST_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::UnsupportedVersion(ver));
        }

        let typ = FrameType::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(crate::WireError::ReservedBits)?;
        let code = StatusCode::try_from(buf.get_u8())?;
        let reserved0 = buf.get_u8();
        let reserved1 = buf.get_u16();

        if reserved0 != 0 || reserved1 != 0 {
            return Err(crate::WireError::ReservedBits);
        }

        let msg_id = buf.get_u64();
        let corr_id = buf.get_u64();

        Ok(Self {
            ver,
            typ,
            flags,
            code,
            reserved0,
            reserved1,
            msg_id,
            corr_id,
        })
    }
}

/// Calculate the CRC32 checksum of an encoded fast header
pub fn crc32_fast_header(fast: &FastHeader) -> u32 {
    let mut buf = BytesMut::with_capacity(FAST_HEADER_SIZE);
    fast.encode(&mut buf);
    crc32fast::hash(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x00).unwrap(), FrameType::Data);
        assert_eq!(FrameType::try_from(0x04).unwrap(), FrameType::Resume);
        assert_eq!(FrameType::try_from(0x07).unwrap(), FrameType::Bye);
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_status_code_conversion() {
        assert_eq!(StatusCode::try_from(6).unwrap(), StatusCode::SessionAlreadyBound);
        assert_eq!(StatusCode::try_from(8).unwrap(), StatusCode::HeartbeatTimeout);
        assert_eq!(StatusCode::try_from(42), Err(crate::WireError::UnknownStatusCode(42)));
    }

    #[test]
    fn test_fast_header_encode_decode() {
        let header = FastHeader::new(FrameType::Reject)
            .with_code(StatusCode::IpMismatch)
            .with_corr_id(0x9876543210FEDCBA);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FAST_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = FastHeader::decode(&mut bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_decode_rejects_reserved_and_version() {
        let mut header = FastHeader::new(FrameType::Ping);
        header.reserved1 = 7;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            FastHeader::decode(&mut buf.freeze()),
            Err(crate::WireError::ReservedBits)
        );

        let mut header = FastHeader::new(FrameType::Ping);
        header.ver = 2;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            FastHeader::decode(&mut buf.freeze()),
            Err(crate::WireError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_checksum_changes_with_header() {
        let a = FastHeader::new(FrameType::Ping).with_corr_id(1);
        let b = FastHeader::new(FrameType::Ping).with_corr_id(2);
        assert_ne!(crc32_fast_header(&a), crc32_fast_header(&b));
        assert_eq!(crc32_fast_header(&a), crc32_fast_header(&a));
    }
}
