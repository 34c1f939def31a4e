//! Connection lifecycle coordinator.
//!
//! [`Server`] attaches to a transport's listener registry, spawns one task per
//! accepted connection and exposes the administrative surface: sending to and
//! closing connections, inspecting and discarding sessions, and subscribing
//! to lifecycle events.

use crate::config::{ServerConfig, ServerOptions};
use crate::connection::{spawn_connection, ConnectionCommand, ConnectionInfo, ConnectionState, Shared};
use crate::error::ServerError;
use crate::events::{EventNotifier, EventRecord, ServerEvent};
use crate::transport::{Accepted, ConnectionMeta, Listener, ListenerToken, TransportSource};
use bytes::Bytes;
use dashmap::DashMap;
use socketeer_store::{ConnectionId, Session, SessionId, SessionStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Listeners held on the transport while listening
struct Attachment {
    source: Arc<dyn TransportSource>,
    tokens: Vec<ListenerToken>,
    dispatcher: JoinHandle<()>,
}

impl Attachment {
    fn detach(self) {
        for token in self.tokens {
            if !self.source.remove_listener(token) {
                warn!("Listener {:?} was already removed from the transport", token);
            }
        }
        self.dispatcher.abort();
    }
}

/// Socketeer server
pub struct Server {
    shared: Shared,
    attachment: Option<Attachment>,
    sweeper: Option<JoinHandle<()>>,
    /// Free-form storage for the embedding application, never read by the server
    pub data: HashMap<String, serde_json::Value>,
}

impl Server {
    /// Validate options and create a detached server
    pub fn new(options: &ServerOptions) -> Result<Self, ServerError> {
        let config = ServerConfig::from_options(options)?;
        Ok(Self::with_config(config))
    }

    /// Create a detached server from a resolved configuration
    pub fn with_config(config: ServerConfig) -> Self {
        let store = Arc::new(SessionStore::new(config.store_config()));
        Self {
            shared: Shared {
                config: Arc::new(config),
                store,
                notifier: EventNotifier::default(),
                registry: Arc::new(DashMap::new()),
            },
            attachment: None,
            sweeper: None,
            data: HashMap::new(),
        }
    }

    /// Resolved configuration
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.shared.notifier.subscribe()
    }

    /// Whether the server is attached to a transport
    pub fn is_listening(&self) -> bool {
        self.attachment.is_some()
    }

    /// Attach to a transport and start accepting connections.
    ///
    /// Registers exactly one error, one headers and one connection listener.
    /// Must be called from within a tokio runtime.
    pub fn listen<S>(&mut self, source: Arc<S>) -> Result<(), ServerError>
    where
        S: TransportSource + 'static,
    {
        if self.attachment.is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (headers_tx, headers_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();

        let source: Arc<dyn TransportSource> = source;
        let tokens = vec![
            source.add_listener(Listener::Error(error_tx)),
            source.add_listener(Listener::Headers(headers_tx)),
            source.add_listener(Listener::Connection(connection_tx)),
        ];
        let dispatcher = tokio::spawn(dispatch(
            self.shared.clone(),
            error_rx,
            headers_rx,
            connection_rx,
        ));

        if self.sweeper.is_none() && self.shared.config.supports_resuming {
            let store = self.shared.store.clone();
            self.sweeper = Some(tokio::spawn(
                store.run_sweeper(self.shared.config.sweep_interval),
            ));
        }

        self.attachment = Some(Attachment {
            source,
            tokens,
            dispatcher,
        });
        info!("Server listening");
        Ok(())
    }

    /// Alias of [`Server::listen`]
    pub fn start<S>(&mut self, source: Arc<S>) -> Result<(), ServerError>
    where
        S: TransportSource + 'static,
    {
        self.listen(source)
    }

    /// Detach from the transport.
    ///
    /// Removes the listeners added by `listen`; connections already accepted
    /// stay up until they close on their own.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let attachment = self.attachment.take().ok_or(ServerError::NotListening)?;
        attachment.detach();
        info!(
            "Server stopped listening, {} connections remain",
            self.shared.registry.len()
        );
        Ok(())
    }

    /// Alias of [`Server::stop`]
    pub fn stop_listening(&mut self) -> Result<(), ServerError> {
        self.stop()
    }

    /// Send an application payload to an active connection
    pub async fn send(
        &self,
        connection_id: ConnectionId,
        payload: impl Into<Bytes>,
    ) -> Result<(), ServerError> {
        let commands = self
            .shared
            .registry
            .get(&connection_id)
            .map(|handle| handle.commands.clone())
            .ok_or(ServerError::UnknownConnection(connection_id))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(ConnectionCommand::Send {
                payload: payload.into(),
                reply: reply_tx,
            })
            .map_err(|_| ServerError::UnknownConnection(connection_id))?;

        reply_rx
            .await
            .map_err(|_| ServerError::UnknownConnection(connection_id))?
    }

    /// Close a connection, keeping its session resumable
    pub fn close(&self, connection_id: ConnectionId) -> Result<(), ServerError> {
        self.command_close(connection_id, false)
    }

    /// Close a connection and discard its session
    pub fn close_and_discard(&self, connection_id: ConnectionId) -> Result<(), ServerError> {
        self.command_close(connection_id, true)
    }

    fn command_close(&self, connection_id: ConnectionId, discard: bool) -> Result<(), ServerError> {
        let handle = self
            .shared
            .registry
            .get(&connection_id)
            .ok_or(ServerError::UnknownConnection(connection_id))?;
        handle
            .commands
            .send(ConnectionCommand::Close { discard })
            .map_err(|_| ServerError::UnknownConnection(connection_id))?;
        debug!(connection_id = %connection_id, discard, "Requested close");
        Ok(())
    }

    /// Delete a session, whether or not a connection holds it.
    ///
    /// A connection bound to the session stays up; it simply has nothing to
    /// release when it ends.
    pub fn discard_session(&self, session_id: &SessionId) -> bool {
        self.shared.store.discard(session_id).is_some()
    }

    /// Replace the application state of the session bound to a connection
    pub fn update_session_state(
        &self,
        connection_id: ConnectionId,
        application_state: serde_json::Value,
    ) -> Result<(), ServerError> {
        let info = self
            .connection(connection_id)
            .ok_or(ServerError::UnknownConnection(connection_id))?;
        let session_id = info
            .session_id
            .ok_or(ServerError::NoSession(connection_id))?;
        self.shared
            .store
            .update_state(&session_id, connection_id, application_state)?;
        Ok(())
    }

    /// Snapshot of a session
    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.shared.store.get(session_id)
    }

    /// Number of sessions held, bound or resumable
    pub fn session_count(&self) -> usize {
        self.shared.store.len()
    }

    /// Snapshot of a live connection
    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.shared
            .registry
            .get(&connection_id)
            .map(|handle| handle.info())
    }

    /// Lifecycle state of a live connection
    pub fn connection_state(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.connection(connection_id).map(|info| info.state)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.detach();
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn dispatch(
    shared: Shared,
    mut errors: mpsc::UnboundedReceiver<String>,
    mut headers: mpsc::UnboundedReceiver<ConnectionMeta>,
    mut connections: mpsc::UnboundedReceiver<Accepted>,
) {
    loop {
        tokio::select! {
            Some(message) = errors.recv() => {
                warn!("Transport error: {}", message);
                shared.notifier.publish(ServerEvent::TransportError {
                    connection_id: None,
                    message,
                });
            }
            Some(meta) = headers.recv() => {
                debug!(peer = %meta.remote_addr, "Connection metadata with {} headers", meta.headers.len());
            }
            Some(accepted) = connections.recv() => {
                spawn_connection(&shared, accepted);
            }
            else => break,
        }
    }
    debug!("Listener dispatch finished");
}
