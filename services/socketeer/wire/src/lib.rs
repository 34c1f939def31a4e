//! Wire framing, fast headers and CBOR metadata for socketeer.
//!
//! This crate provides the low-level wire format shared by the socketeer
//! server and its peers: the handshake control frames (HELLO, RESUME,
//! WELCOME, REJECT), heartbeat frames (PING/PONG), graceful close (BYE)
//! and opaque application DATA frames.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Fast Header (24B)    | type, flags, code, ids     |
//! +----------------------+----------------------------+
//! | u32 meta_len         | canonical CBOR map length  |
//! +----------------------+----------------------------+
//! | meta_bytes           | metadata (CBOR)            |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{
    get_meta_bool, get_meta_str, get_meta_u32, parse_meta, verify_header_checksum, CodecError,
    FrameBuilder, MetaBuilder,
};
pub use error::WireError;
pub use frame::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE, MAX_META_SIZE};
pub use header::{
    crc32_fast_header, FastHeader, Flags, FrameType, StatusCode, FAST_HEADER_SIZE, WIRE_VERSION,
};
