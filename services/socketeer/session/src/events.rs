//! Lifecycle notifications published by the server.
//!
//! Every event is stamped with a process-unique sequence number and a wall
//! clock timestamp, then broadcast to all current subscribers. Publishing is
//! fire-and-forget: slow subscribers lag and lose events, nobody blocks.

use crate::error::{CloseCause, RejectReason};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use socketeer_store::{ConnectionId, SessionId, StoreError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default subscriber buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A lifecycle event
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Transport handed over a new physical connection
    ConnectionAccepted {
        /// New connection
        connection_id: ConnectionId,
        /// Peer address
        remote_addr: SocketAddr,
    },
    /// Handshake created a fresh session
    SessionCreated {
        /// Owning connection
        connection_id: ConnectionId,
        /// New session
        session_id: SessionId,
    },
    /// Handshake resumed an idle session
    SessionResumed {
        /// New owning connection
        connection_id: ConnectionId,
        /// Resumed session
        session_id: SessionId,
        /// Application state carried over from the previous connection
        application_state: serde_json::Value,
    },
    /// Handshake completed, heartbeat running
    ConnectionActive {
        /// Connection
        connection_id: ConnectionId,
        /// Bound session, none when resuming is disabled
        session_id: Option<SessionId>,
    },
    /// Handshake refused
    HandshakeRejected {
        /// Connection
        connection_id: ConnectionId,
        /// Why
        reason: RejectReason,
    },
    /// Peer missed its pong deadline
    HeartbeatTimeout {
        /// Connection
        connection_id: ConnectionId,
        /// Bound session
        session_id: Option<SessionId>,
    },
    /// Application payload from an active connection
    MessageReceived {
        /// Connection
        connection_id: ConnectionId,
        /// Bound session
        session_id: Option<SessionId>,
        /// Peer message id
        msg_id: u64,
        /// Opaque payload
        payload: Bytes,
    },
    /// Connection fully torn down
    ConnectionClosed {
        /// Connection
        connection_id: ConnectionId,
        /// Session that was bound when it closed
        session_id: Option<SessionId>,
        /// Why it closed
        cause: CloseCause,
        /// Whether the session is still resumable
        session_resumable: bool,
    },
    /// Store refused a lifecycle operation
    StoreError {
        /// Connection involved
        connection_id: Option<ConnectionId>,
        /// Store error
        error: StoreError,
    },
    /// Transport reported an error
    TransportError {
        /// Connection involved, none for listener-level errors
        connection_id: Option<ConnectionId>,
        /// Error description
        message: String,
    },
}

impl ServerEvent {
    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionAccepted { .. } => "connectionAccepted",
            ServerEvent::SessionCreated { .. } => "sessionCreated",
            ServerEvent::SessionResumed { .. } => "sessionResumed",
            ServerEvent::ConnectionActive { .. } => "connectionActive",
            ServerEvent::HandshakeRejected { .. } => "handshakeRejected",
            ServerEvent::HeartbeatTimeout { .. } => "heartbeatTimeout",
            ServerEvent::MessageReceived { .. } => "messageReceived",
            ServerEvent::ConnectionClosed { .. } => "connectionClosed",
            ServerEvent::StoreError { .. } => "storeError",
            ServerEvent::TransportError { .. } => "transportError",
        }
    }

    /// Connection the event concerns, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            ServerEvent::ConnectionAccepted { connection_id, .. }
            | ServerEvent::SessionCreated { connection_id, .. }
            | ServerEvent::SessionResumed { connection_id, .. }
            | ServerEvent::ConnectionActive { connection_id, .. }
            | ServerEvent::HandshakeRejected { connection_id, .. }
            | ServerEvent::HeartbeatTimeout { connection_id, .. }
            | ServerEvent::MessageReceived { connection_id, .. }
            | ServerEvent::ConnectionClosed { connection_id, .. } => Some(*connection_id),
            ServerEvent::StoreError { connection_id, .. }
            | ServerEvent::TransportError { connection_id, .. } => *connection_id,
        }
    }
}

/// A published event with its envelope
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Monotonically increasing sequence number, starting at 1
    pub sequence: u64,
    /// Wall clock time of publication
    pub timestamp: DateTime<Utc>,
    /// The event
    pub event: ServerEvent,
}

/// Broadcast publisher for lifecycle events
#[derive(Debug, Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<EventRecord>,
    sequence_counter: Arc<AtomicU64>,
}

impl EventNotifier {
    /// Create a notifier buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sequence_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Publish an event, returning its sequence number
    pub fn publish(&self, event: ServerEvent) -> u64 {
        let sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        let name = event.name();
        let record = EventRecord {
            sequence,
            timestamp: Utc::now(),
            event,
        };

        match self.tx.send(record) {
            Ok(receivers) => trace!("Published {} (seq: {}) to {} subscribers", name, sequence, receivers),
            Err(_) => debug!("No subscribers for {} (seq: {})", name, sequence),
        }
        sequence
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_sequenced() {
        let notifier = EventNotifier::default();
        let mut rx = notifier.subscribe();

        let first = notifier.publish(ServerEvent::TransportError {
            connection_id: None,
            message: "boom".to_string(),
        });
        let second = notifier.publish(ServerEvent::HeartbeatTimeout {
            connection_id: ConnectionId(7),
            session_id: None,
        });
        assert_eq!(second, first + 1);

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.sequence, first);
        assert_eq!(a.event.name(), "transportError");
        assert_eq!(a.event.connection_id(), None);
        assert_eq!(b.event.connection_id(), Some(ConnectionId(7)));
        assert!(b.timestamp >= a.timestamp);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = EventNotifier::new(4);
        let seq = notifier.publish(ServerEvent::TransportError {
            connection_id: None,
            message: "nobody listening".to_string(),
        });
        assert_eq!(seq, 1);
    }
}
