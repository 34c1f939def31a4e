//! Transport boundary.
//!
//! The server never touches sockets. A transport exposes a
//! [`TransportSource`] the server attaches listeners to, and hands every
//! accepted connection over as a [`Link`]: a stream of raw byte chunks and
//! close/error notifications one way, send/close commands the other way.
//!
//! [`EventSource`] is the listener registry every transport here is built
//! on; [`memory_link`] creates an in-process link for tests and embedding.

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Buffer of transport-to-server link events per connection
pub const LINK_EVENT_BUFFER: usize = 256;

/// Something the transport observed on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw bytes, not necessarily frame aligned
    Data(Bytes),
    /// Peer closed the connection
    Closed,
    /// Transport failure, the connection is unusable
    Error(String),
}

/// Something the server asks the transport to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Write bytes to the peer
    Send(Bytes),
    /// Close the connection
    Close,
}

/// Server side of a physical connection
#[derive(Debug)]
pub struct Link {
    /// Events from the transport
    pub events: mpsc::Receiver<LinkEvent>,
    /// Commands to the transport
    pub commands: mpsc::UnboundedSender<LinkCommand>,
}

/// A freshly accepted connection
#[derive(Debug)]
pub struct Accepted {
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Channels to and from the transport
    pub link: Link,
}

/// Connection metadata announced before a connection is handed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMeta {
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Transport specific headers, e.g. from an HTTP upgrade
    pub headers: Vec<(String, String)>,
}

/// Listener kinds a transport source supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Listener-level errors
    Error,
    /// Connection metadata
    Headers,
    /// New connections
    Connection,
}

/// A listener registered with a transport source
#[derive(Debug, Clone)]
pub enum Listener {
    /// Receives listener-level errors
    Error(mpsc::UnboundedSender<String>),
    /// Receives connection metadata
    Headers(mpsc::UnboundedSender<ConnectionMeta>),
    /// Receives new connections
    Connection(mpsc::UnboundedSender<Accepted>),
}

impl Listener {
    /// Kind of this listener
    pub fn kind(&self) -> ListenerKind {
        match self {
            Listener::Error(_) => ListenerKind::Error,
            Listener::Headers(_) => ListenerKind::Headers,
            Listener::Connection(_) => ListenerKind::Connection,
        }
    }
}

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// Listener registry of a transport
pub trait TransportSource: Send + Sync {
    /// Register a listener
    fn add_listener(&self, listener: Listener) -> ListenerToken;

    /// Remove a listener, returning whether it was registered
    fn remove_listener(&self, token: ListenerToken) -> bool;
}

/// Listener registry with emit helpers for transport implementations
#[derive(Debug, Default)]
pub struct EventSource {
    listeners: DashMap<ListenerToken, Listener>,
    next_token: AtomicU64,
}

impl EventSource {
    /// Create a registry with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered listeners of a kind
    pub fn listener_count(&self, kind: ListenerKind) -> usize {
        self.listeners
            .iter()
            .filter(|entry| entry.value().kind() == kind)
            .count()
    }

    /// Deliver an error to every error listener, returning how many got it
    pub fn emit_error(&self, message: impl Into<String>) -> usize {
        let message = message.into();
        let mut delivered = 0;
        for entry in self.listeners.iter() {
            if let Listener::Error(tx) = entry.value() {
                if tx.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!("Delivered transport error to {} listeners", delivered);
        delivered
    }

    /// Deliver connection metadata to every headers listener
    pub fn emit_headers(&self, meta: ConnectionMeta) -> usize {
        let mut delivered = 0;
        for entry in self.listeners.iter() {
            if let Listener::Headers(tx) = entry.value() {
                if tx.send(meta.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Hand a connection to a connection listener.
    ///
    /// The connection is returned when no live listener takes it, so the
    /// transport can close it.
    pub fn emit_connection(&self, accepted: Accepted) -> Result<(), Accepted> {
        let mut accepted = accepted;
        for entry in self.listeners.iter() {
            if let Listener::Connection(tx) = entry.value() {
                match tx.send(accepted) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(returned)) => accepted = returned,
                }
            }
        }
        debug!("No connection listener for {}", accepted.remote_addr);
        Err(accepted)
    }
}

impl TransportSource for EventSource {
    fn add_listener(&self, listener: Listener) -> ListenerToken {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        trace!("Added {:?} listener {:?}", listener.kind(), token);
        self.listeners.insert(token, listener);
        token
    }

    fn remove_listener(&self, token: ListenerToken) -> bool {
        self.listeners.remove(&token).is_some()
    }
}

/// Peer end of an in-memory link
#[derive(Debug)]
pub struct MemoryPeer {
    remote_addr: SocketAddr,
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
}

impl MemoryPeer {
    /// Address the server sees for this peer
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Deliver bytes to the server, false once the server side is gone
    pub async fn send(&self, bytes: Bytes) -> bool {
        self.events.send(LinkEvent::Data(bytes)).await.is_ok()
    }

    /// Report the connection closed by the peer
    pub async fn close(&self) -> bool {
        self.events.send(LinkEvent::Closed).await.is_ok()
    }

    /// Report a transport failure
    pub async fn fail(&self, message: impl Into<String>) -> bool {
        self.events
            .send(LinkEvent::Error(message.into()))
            .await
            .is_ok()
    }

    /// Next command from the server, `None` once the server dropped the link
    pub async fn recv(&mut self) -> Option<LinkCommand> {
        self.commands.recv().await
    }
}

/// Create an in-memory connection from `remote_addr`
pub fn memory_link(remote_addr: SocketAddr) -> (Accepted, MemoryPeer) {
    let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let accepted = Accepted {
        remote_addr,
        link: Link {
            events: event_rx,
            commands: command_tx,
        },
    };
    let peer = MemoryPeer {
        remote_addr,
        events: event_tx,
        commands: command_rx,
    };
    (accepted, peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_listener_registration() {
        let source = EventSource::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let token = source.add_listener(Listener::Error(tx));
        assert_eq!(source.listener_count(ListenerKind::Error), 1);
        assert_eq!(source.listener_count(ListenerKind::Connection), 0);

        assert!(source.remove_listener(token));
        assert!(!source.remove_listener(token));
        assert_eq!(source.listener_count(ListenerKind::Error), 0);
    }

    #[tokio::test]
    async fn test_emit_connection_without_listener_returns_it() {
        let source = EventSource::new();
        let (accepted, _peer) = memory_link(addr());
        let returned = source.emit_connection(accepted).unwrap_err();
        assert_eq!(returned.remote_addr, addr());
    }

    #[tokio::test]
    async fn test_emit_connection_skips_dead_listeners() {
        let source = EventSource::new();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        source.add_listener(Listener::Connection(dead_tx));
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        source.add_listener(Listener::Connection(live_tx));

        let (accepted, _peer) = memory_link(addr());
        assert!(source.emit_connection(accepted).is_ok());
        assert_eq!(live_rx.recv().await.unwrap().remote_addr, addr());
    }

    #[tokio::test]
    async fn test_emit_error_and_headers() {
        let source = EventSource::new();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let (headers_tx, mut headers_rx) = mpsc::unbounded_channel();
        source.add_listener(Listener::Error(error_tx));
        source.add_listener(Listener::Headers(headers_tx));

        assert_eq!(source.emit_error("accept failed"), 1);
        assert_eq!(error_rx.recv().await.unwrap(), "accept failed");

        let meta = ConnectionMeta {
            remote_addr: addr(),
            headers: vec![("x-client".to_string(), "test".to_string())],
        };
        assert_eq!(source.emit_headers(meta.clone()), 1);
        assert_eq!(headers_rx.recv().await.unwrap(), meta);
    }

    #[tokio::test]
    async fn test_memory_link_carries_both_directions() {
        let (accepted, mut peer) = memory_link(addr());
        let Link {
            mut events,
            commands,
        } = accepted.link;

        assert!(peer.send(Bytes::from_static(b"abc")).await);
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Data(Bytes::from_static(b"abc")))
        );

        commands.send(LinkCommand::Close).unwrap();
        assert_eq!(peer.recv().await, Some(LinkCommand::Close));

        drop(events);
        assert!(!peer.close().await);
    }
}
