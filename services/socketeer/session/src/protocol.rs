//! Control and data frames exchanged with a peer.
//!
//! Builders for every frame the server and its peers send, plus
//! classification of decoded frames in both directions and a buffering
//! [`FrameReader`] that turns raw transport chunks into frames.

use crate::error::RejectReason;
use bytes::{Bytes, BytesMut};
use socketeer_store::SessionId;
use socketeer_wire::{
    get_meta_bool, get_meta_str, parse_meta, verify_header_checksum, CodecError, FastHeader, Flags,
    Frame, FrameBuilder, FrameDecoder, FrameType, StatusCode, DEFAULT_MAX_FRAME_SIZE,
};

/// Metadata key carrying the session id
pub const META_SESSION_ID: &str = "session-id";
/// Metadata key flagging a resumed session in WELCOME
pub const META_RESUMED: &str = "resumed";
/// Metadata key carrying the human readable REJECT reason
pub const META_REASON: &str = "reason";

/// Size limit for control frames
pub const CONTROL_FRAME_LIMIT: usize = 64 * 1024;

fn control_frame(builder: FrameBuilder) -> Bytes {
    builder
        .build(CONTROL_FRAME_LIMIT)
        .expect("control frame build should never fail")
}

/// Build a HELLO frame requesting a new session
pub fn build_hello() -> Bytes {
    control_frame(FrameBuilder::new(FastHeader::new(FrameType::Hello)))
}

/// Build a RESUME frame for an existing session
pub fn build_resume(session_id: &SessionId) -> Bytes {
    control_frame(
        FrameBuilder::new(FastHeader::new(FrameType::Resume))
            .meta_insert_str(META_SESSION_ID, session_id.as_str()),
    )
}

/// Build a WELCOME frame accepting a handshake
pub fn build_welcome(session_id: Option<&SessionId>, resumed: bool) -> Bytes {
    let mut builder =
        FrameBuilder::new(FastHeader::new(FrameType::Welcome)).meta_insert_bool(META_RESUMED, resumed);
    if let Some(session_id) = session_id {
        builder = builder.meta_insert_str(META_SESSION_ID, session_id.as_str());
    }
    control_frame(builder)
}

/// Build a REJECT frame carrying the reason as status code and text
pub fn build_reject(reason: RejectReason) -> Bytes {
    control_frame(
        FrameBuilder::new(FastHeader::new(FrameType::Reject).with_code(reason.status_code()))
            .meta_insert_str(META_REASON, &reason.to_string()),
    )
}

/// Build a PING frame with a correlation id
pub fn build_ping(corr_id: u64) -> Bytes {
    control_frame(
        FrameBuilder::new(FastHeader::new(FrameType::Ping).with_corr_id(corr_id))
            .flags(Flags::HDR_CHECKSUM),
    )
}

/// Build a PONG frame echoing a PING correlation id
pub fn build_pong(corr_id: u64) -> Bytes {
    control_frame(
        FrameBuilder::new(FastHeader::new(FrameType::Pong).with_corr_id(corr_id))
            .flags(Flags::HDR_CHECKSUM),
    )
}

/// Build a BYE frame, optionally asking for the session to be discarded
pub fn build_bye(end_session: bool) -> Bytes {
    let mut builder = FrameBuilder::new(FastHeader::new(FrameType::Bye));
    if end_session {
        builder = builder.flags(Flags::END_SESSION);
    }
    control_frame(builder)
}

/// Build a DATA frame around an opaque payload
pub fn build_data(msg_id: u64, payload: Bytes) -> Result<Bytes, CodecError> {
    let mut fast = FastHeader::new(FrameType::Data);
    fast.msg_id = msg_id;
    FrameBuilder::new(fast)
        .payload(payload)
        .build(DEFAULT_MAX_FRAME_SIZE)
}

/// A frame received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    /// New session request
    Hello,
    /// Resume request
    Resume(SessionId),
    /// Application payload
    Data {
        /// Peer message id
        msg_id: u64,
        /// Opaque payload
        payload: Bytes,
    },
    /// Liveness probe from the peer
    Ping(u64),
    /// Answer to one of our probes
    Pong(u64),
    /// Graceful close
    Bye {
        /// Peer wants its session discarded
        end_session: bool,
    },
    /// A frame type only the server may send
    Unexpected(FrameType),
}

impl PeerFrame {
    /// Classify a decoded frame
    pub fn from_frame(frame: Frame) -> Result<Self, CodecError> {
        let fast = frame.fast;
        Ok(match fast.typ {
            FrameType::Hello => PeerFrame::Hello,
            FrameType::Resume => {
                let meta = parse_meta(&frame.meta_raw)?;
                let session_id =
                    get_meta_str(&meta, META_SESSION_ID).ok_or(CodecError::MetaDecode)?;
                PeerFrame::Resume(SessionId::from(session_id))
            }
            FrameType::Data => PeerFrame::Data {
                msg_id: fast.msg_id,
                payload: frame.payload,
            },
            FrameType::Ping => PeerFrame::Ping(fast.corr_id),
            FrameType::Pong => PeerFrame::Pong(fast.corr_id),
            FrameType::Bye => PeerFrame::Bye {
                end_session: fast.flags.contains(Flags::END_SESSION),
            },
            other @ (FrameType::Welcome | FrameType::Reject) => PeerFrame::Unexpected(other),
        })
    }
}

/// A frame received from the server, as seen by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Handshake accepted
    Welcome {
        /// Bound session, none when the server runs without sessions
        session_id: Option<SessionId>,
        /// Whether an existing session was resumed
        resumed: bool,
    },
    /// Handshake rejected
    Reject {
        /// Reason code
        code: StatusCode,
        /// Reason text
        reason: String,
    },
    /// Liveness probe
    Ping(u64),
    /// Answer to a peer probe
    Pong(u64),
    /// Application payload
    Data {
        /// Message id
        msg_id: u64,
        /// Opaque payload
        payload: Bytes,
    },
    /// Graceful close
    Bye {
        /// Session discarded
        end_session: bool,
    },
    /// A frame type only peers may send
    Unexpected(FrameType),
}

impl ServerFrame {
    /// Classify a decoded frame
    pub fn from_frame(frame: Frame) -> Result<Self, CodecError> {
        let fast = frame.fast;
        Ok(match fast.typ {
            FrameType::Welcome => {
                let meta = parse_meta(&frame.meta_raw)?;
                ServerFrame::Welcome {
                    session_id: get_meta_str(&meta, META_SESSION_ID).map(SessionId::from),
                    resumed: get_meta_bool(&meta, META_RESUMED).unwrap_or(false),
                }
            }
            FrameType::Reject => {
                let meta = parse_meta(&frame.meta_raw)?;
                ServerFrame::Reject {
                    code: fast.code,
                    reason: get_meta_str(&meta, META_REASON).unwrap_or_default(),
                }
            }
            FrameType::Ping => ServerFrame::Ping(fast.corr_id),
            FrameType::Pong => ServerFrame::Pong(fast.corr_id),
            FrameType::Data => ServerFrame::Data {
                msg_id: fast.msg_id,
                payload: frame.payload,
            },
            FrameType::Bye => ServerFrame::Bye {
                end_session: fast.flags.contains(Flags::END_SESSION),
            },
            other @ (FrameType::Hello | FrameType::Resume) => ServerFrame::Unexpected(other),
        })
    }
}

/// Reassembles frames from arbitrarily split transport chunks
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl FrameReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received from the transport
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Create a reader refusing frames larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Change the frame size limit for frames not yet decoded
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    }

    /// Pull the next complete frame, verifying its header checksum.
    ///
    /// After an error the buffered stream is unusable.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let Some(frame) = self.decoder.decode(&mut self.buffer)? else {
            return Ok(None);
        };
        verify_header_checksum(&frame)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socketeer_wire::WireError;

    fn read_one(bytes: &Bytes) -> Frame {
        let mut reader = FrameReader::new();
        reader.push(bytes);
        reader.next_frame().unwrap().unwrap()
    }

    #[test]
    fn test_handshake_requests() {
        assert_eq!(
            PeerFrame::from_frame(read_one(&build_hello())).unwrap(),
            PeerFrame::Hello
        );

        let id = SessionId::generate();
        let resume = PeerFrame::from_frame(read_one(&build_resume(&id))).unwrap();
        assert_eq!(resume, PeerFrame::Resume(id));
    }

    #[test]
    fn test_resume_without_session_id_is_malformed() {
        let bytes = FrameBuilder::new(FastHeader::new(FrameType::Resume))
            .build(CONTROL_FRAME_LIMIT)
            .unwrap();
        assert!(matches!(
            PeerFrame::from_frame(read_one(&bytes)),
            Err(CodecError::MetaDecode)
        ));
    }

    #[test]
    fn test_welcome_and_reject() {
        let id = SessionId::generate();
        assert_eq!(
            ServerFrame::from_frame(read_one(&build_welcome(Some(&id), true))).unwrap(),
            ServerFrame::Welcome {
                session_id: Some(id),
                resumed: true
            }
        );
        assert_eq!(
            ServerFrame::from_frame(read_one(&build_welcome(None, false))).unwrap(),
            ServerFrame::Welcome {
                session_id: None,
                resumed: false
            }
        );
        assert_eq!(
            ServerFrame::from_frame(read_one(&build_reject(RejectReason::IpMismatch))).unwrap(),
            ServerFrame::Reject {
                code: StatusCode::IpMismatch,
                reason: "session origin IP mismatch".to_string()
            }
        );
    }

    #[test]
    fn test_ping_pong_bye_data() {
        assert_eq!(
            ServerFrame::from_frame(read_one(&build_ping(11))).unwrap(),
            ServerFrame::Ping(11)
        );
        assert_eq!(
            PeerFrame::from_frame(read_one(&build_pong(11))).unwrap(),
            PeerFrame::Pong(11)
        );
        assert_eq!(
            PeerFrame::from_frame(read_one(&build_bye(true))).unwrap(),
            PeerFrame::Bye { end_session: true }
        );
        assert_eq!(
            PeerFrame::from_frame(read_one(&build_data(3, Bytes::from_static(b"hi")).unwrap()))
                .unwrap(),
            PeerFrame::Data {
                msg_id: 3,
                payload: Bytes::from_static(b"hi")
            }
        );
        assert_eq!(
            PeerFrame::from_frame(read_one(&build_welcome(None, false))).unwrap(),
            PeerFrame::Unexpected(FrameType::Welcome)
        );
    }

    #[test]
    fn test_reader_handles_split_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&build_hello());
        stream.extend_from_slice(&build_ping(1));

        let mut reader = FrameReader::new();
        for byte in &stream {
            reader.push(std::slice::from_ref(byte));
        }

        assert_eq!(reader.next_frame().unwrap().unwrap().fast.typ, FrameType::Hello);
        assert_eq!(reader.next_frame().unwrap().unwrap().fast.typ, FrameType::Ping);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_reader_limit_applies_to_announced_length() {
        let payload = Bytes::from(vec![7u8; CONTROL_FRAME_LIMIT]);
        let data = build_data(1, payload).unwrap();

        let mut reader = FrameReader::with_max_frame_size(CONTROL_FRAME_LIMIT);
        // The length prefix alone is enough to refuse the frame
        reader.push(&data[..4]);
        assert!(matches!(
            reader.next_frame(),
            Err(CodecError::Wire(WireError::FrameTooLarge { .. }))
        ));

        let mut reader = FrameReader::with_max_frame_size(CONTROL_FRAME_LIMIT);
        reader.push(&build_hello());
        assert_eq!(reader.next_frame().unwrap().unwrap().fast.typ, FrameType::Hello);
        reader.set_max_frame_size(DEFAULT_MAX_FRAME_SIZE);
        reader.push(&data);
        assert_eq!(reader.next_frame().unwrap().unwrap().payload.len(), CONTROL_FRAME_LIMIT);
    }

    #[test]
    fn test_reader_rejects_garbage() {
        let mut reader = FrameReader::new();
        reader.push(&[0, 0, 0, 1, 0xFF]);
        assert!(reader.next_frame().is_err());
    }
}
