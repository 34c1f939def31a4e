//! Error taxonomy of the connection lifecycle.
//!
//! Per-connection failures never escape as `Result`s: they end the
//! connection and surface as [`crate::ServerEvent`]s carrying a
//! [`RejectReason`] or [`CloseCause`]. Administrative calls on the
//! [`crate::Server`] fail synchronously with [`ServerError`].

use crate::config::ConfigError;
use socketeer_store::{ConnectionId, ReleaseCause, StoreError};
use socketeer_wire::{CodecError, StatusCode};
use thiserror::Error;

/// Why a handshake was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// No valid request arrived before the deadline
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// Unexpected, duplicate or undecodable frame
    #[error("protocol violation")]
    ProtocolViolation,
    /// Resume requested while resuming is disabled
    #[error("session resuming is not supported")]
    ResumingNotSupported,
    /// Unknown session id
    #[error("session not found")]
    SessionNotFound,
    /// Session idled past its maximum age
    #[error("session expired")]
    SessionExpired,
    /// Session is owned by another live connection
    #[error("session already bound to another connection")]
    SessionAlreadyBound,
    /// Resume attempted from a different IP than the session origin
    #[error("session origin IP mismatch")]
    IpMismatch,
}

impl RejectReason {
    /// Status code carried by the REJECT frame
    pub fn status_code(self) -> StatusCode {
        match self {
            RejectReason::HandshakeTimeout => StatusCode::HandshakeTimeout,
            RejectReason::ProtocolViolation => StatusCode::ProtocolViolation,
            RejectReason::ResumingNotSupported => StatusCode::ResumingNotSupported,
            RejectReason::SessionNotFound => StatusCode::SessionNotFound,
            RejectReason::SessionExpired => StatusCode::SessionExpired,
            RejectReason::SessionAlreadyBound => StatusCode::SessionAlreadyBound,
            RejectReason::IpMismatch => StatusCode::IpMismatch,
        }
    }
}

impl From<StoreError> for RejectReason {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(_) => RejectReason::SessionNotFound,
            StoreError::SessionExpired(_) => RejectReason::SessionExpired,
            StoreError::SessionAlreadyBound { .. } => RejectReason::SessionAlreadyBound,
            StoreError::IpMismatch { .. } => RejectReason::IpMismatch,
            StoreError::ResumingDisabled => RejectReason::ResumingNotSupported,
            StoreError::NotOwner { .. } => RejectReason::ProtocolViolation,
        }
    }
}

/// Why a connection ended
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Handshake was refused, or a second handshake request arrived
    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),
    /// Peer stopped answering pings
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    /// Peer sent an unexpected or undecodable frame after the handshake
    #[error("protocol violation")]
    ProtocolViolation,
    /// Peer said goodbye
    #[error("peer closed the session (discard: {discard})")]
    PeerBye {
        /// Whether the peer asked for its session to be discarded
        discard: bool,
    },
    /// Transport reported the connection closed
    #[error("transport closed")]
    TransportClosed,
    /// Transport reported an error
    #[error("transport error: {0}")]
    TransportError(String),
    /// Closed through the administrative surface
    #[error("closed by server (discard: {discard})")]
    ServerClosed {
        /// Whether the bound session is discarded rather than kept resumable
        discard: bool,
    },
}

impl CloseCause {
    /// How the bound session is handed back to the store
    pub fn release_cause(&self) -> ReleaseCause {
        match self {
            CloseCause::PeerBye { discard: true } | CloseCause::ServerClosed { discard: true } => {
                ReleaseCause::Discard
            }
            CloseCause::PeerBye { discard: false } | CloseCause::ServerClosed { discard: false } => {
                ReleaseCause::Graceful
            }
            CloseCause::Rejected(_)
            | CloseCause::HeartbeatTimeout
            | CloseCause::ProtocolViolation
            | CloseCause::TransportClosed
            | CloseCause::TransportError(_) => ReleaseCause::ConnectionLost,
        }
    }
}

/// Errors from the administrative surface of the server
#[derive(Error, Debug)]
pub enum ServerError {
    /// `listen` called while already attached to a transport
    #[error("Server is already listening!")]
    AlreadyListening,
    /// `stop` called while not attached to a transport
    #[error("Server is not listening")]
    NotListening,
    /// No live connection with this id
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    /// Connection exists but has not finished its handshake, or is closing
    #[error("connection {0} is not active")]
    ConnectionNotActive(ConnectionId),
    /// Connection is active but has no bound session
    #[error("connection {0} has no session")]
    NoSession(ConnectionId),
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Session store refused the operation
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Outgoing frame could not be encoded
    #[error("frame encoding failed: {0}")]
    Codec(#[from] CodecError),
}
