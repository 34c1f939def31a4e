//! Resumable session store for socketeer.
//!
//! This crate owns the single in-process map of logical sessions. A session
//! outlives the physical connection that created it: when the connection
//! drops, the session is released back to the store and stays resumable for
//! `max_session_age`, after which it is evicted for good.
//!
//! The store enforces claim-not-steal semantics: a session is bound to at most
//! one live connection, and a resume attempt against a bound session is
//! rejected rather than taking it over.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

pub use store::SessionStore;

/// Opaque, unguessable session token
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Physical connection identifier, unique for the lifetime of the process
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next connection id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical session tracked by the store
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// Session token
    pub id: SessionId,
    /// When the session was created
    pub created_at: Instant,
    /// Last bind or release
    pub last_active_at: Instant,
    /// When an unbound session stops being resumable
    pub expires_at: Instant,
    /// Remote address recorded at creation
    pub origin_ip: IpAddr,
    /// Connection currently owning the session
    pub bound_connection: Option<ConnectionId>,
    /// State owned by the application layer, carried across resumption untouched
    pub application_state: serde_json::Value,
}

impl Session {
    /// Whether a live connection currently owns this session
    pub fn is_bound(&self) -> bool {
        self.bound_connection.is_some()
    }

    /// Whether the session has passed its expiry while idle
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_bound() && now >= self.expires_at
    }

    /// Whether the session is idle and can still be claimed
    pub fn is_resumable(&self, now: Instant) -> bool {
        !self.is_bound() && !self.is_expired(now)
    }
}

/// Why a connection let go of its session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseCause {
    /// Peer closed the connection cleanly
    Graceful,
    /// Connection was lost (transport failure, heartbeat timeout, protocol violation)
    ConnectionLost,
    /// The application or the peer asked for the session to be thrown away
    Discard,
}

/// What happened to a session on release
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Session stays claimable until `expires_at`
    Resumable {
        /// Expiry of the idle session
        expires_at: Instant,
    },
    /// Session was removed from the store
    Deleted,
}

/// Store behaviour, derived from the server configuration
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Whether sessions can be created and resumed at all
    pub supports_resuming: bool,
    /// Whether a session may be resumed from an address other than its origin
    pub resume_allows_different_ips: bool,
    /// How long an idle session stays resumable
    pub max_session_age: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            supports_resuming: false,
            resume_allows_different_ips: false,
            max_session_age: Duration::from_millis(10_000),
        }
    }
}

/// Session store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No session with this id
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// Session idled past its expiry and was evicted
    #[error("session expired: {0}")]
    SessionExpired(SessionId),
    /// Session is owned by another live connection
    #[error("session {session_id} already bound to connection {owner}")]
    SessionAlreadyBound {
        /// Contested session
        session_id: SessionId,
        /// Current owner
        owner: ConnectionId,
    },
    /// Resume attempted from a different address than the session origin
    #[error("session {session_id} originated from {origin}, resume attempted from {requester}")]
    IpMismatch {
        /// Contested session
        session_id: SessionId,
        /// Address recorded at creation
        origin: IpAddr,
        /// Address of the resuming peer
        requester: IpAddr,
    },
    /// Session creation attempted while resuming is disabled
    #[error("session resuming is disabled")]
    ResumingDisabled,
    /// Operation attempted by a connection that does not own the session
    #[error("connection {connection_id} does not own session {session_id}")]
    NotOwner {
        /// Session the operation targeted
        session_id: SessionId,
        /// Connection that attempted it
        connection_id: ConnectionId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_connection_ids_increase() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
    }

    #[test]
    fn test_bound_session_never_expires() {
        let now = Instant::now();
        let mut session = Session {
            id: SessionId::generate(),
            created_at: now,
            last_active_at: now,
            expires_at: now,
            origin_ip: "127.0.0.1".parse().unwrap(),
            bound_connection: Some(ConnectionId(1)),
            application_state: serde_json::Value::Null,
        };
        assert!(!session.is_expired(now));
        assert!(!session.is_resumable(now));

        session.bound_connection = None;
        assert!(session.is_expired(now));
        assert!(!session.is_resumable(now));
    }
}
