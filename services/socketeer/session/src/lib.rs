//! Connection lifecycle and session resumption for socketeer.
//!
//! This crate turns a reconnect-prone message transport into managed
//! logical sessions:
//!
//! - **Handshake**: every new connection must send HELLO (new session) or
//!   RESUME (existing session) before the handshake deadline
//! - **Heartbeat**: active connections are pinged periodically and dropped
//!   when a pong does not come back in time
//! - **Resumption**: sessions outlive their connection and can be claimed by
//!   a new one, from the same IP unless configured otherwise, until they
//!   expire
//! - **Notifications**: lifecycle events are broadcast to subscribers
//!
//! ## Example
//!
//! ```rust,no_run
//! use socketeer_session::{Server, ServerEvent, ServerOptions, TcpTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ServerOptions::new()
//!     .supports_resuming(true)
//!     .heartbeat_interval(5000u64);
//! let mut server = Server::new(&options)?;
//! let mut events = server.subscribe();
//!
//! let transport = Arc::new(TcpTransport::bind("0.0.0.0:7070".parse()?).await?);
//! server.listen(transport)?;
//!
//! while let Ok(record) = events.recv().await {
//!     if let ServerEvent::MessageReceived { connection_id, payload, .. } = record.event {
//!         server.send(connection_id, payload).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod heartbeat;
pub mod protocol;
pub mod server;
pub mod tcp;
pub mod transport;

// Re-export main types
pub use config::{ConfigError, OptionValue, ServerConfig, ServerOptions};
pub use connection::{ConnectionInfo, ConnectionState};
pub use error::{CloseCause, RejectReason, ServerError};
pub use events::{EventNotifier, EventRecord, ServerEvent};
pub use handshake::{Binding, HandshakeMachine, HandshakeRequest, HandshakeState};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use protocol::{FrameReader, PeerFrame, ServerFrame};
pub use server::Server;
pub use tcp::TcpTransport;
pub use transport::{
    memory_link, Accepted, ConnectionMeta, EventSource, Link, LinkCommand, LinkEvent, Listener,
    ListenerKind, ListenerToken, MemoryPeer, TransportSource,
};

pub use socketeer_store::{ConnectionId, Session, SessionId};
