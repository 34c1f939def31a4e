//! Frame decoding and encoding errors.

use thiserror::Error;

/// Errors raised while framing or unframing bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes buffered yet
    #[error("incomplete frame")]
    Incomplete,

    /// Version byte other than the one this codec speaks
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// Frame exceeds the configured or hard size limit
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Encoded or announced frame size
        size: usize,
        /// Limit in force
        limit: usize,
    },

    /// Metadata block too large, truncated or not valid CBOR
    #[error("invalid frame metadata")]
    InvalidMeta,

    /// `hdr_csum` does not match the header
    #[error("header checksum mismatch")]
    ChecksumMismatch,

    /// Reserved header bits or unknown flags set
    #[error("reserved header bits set")]
    ReservedBits,

    /// Frame type byte
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// Status code byte
    #[error("unknown status code {0}")]
    UnknownStatusCode(u8),

    /// Length prefix too short to hold a header
    #[error("malformed frame")]
    Malformed,
}
