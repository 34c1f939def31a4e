//! Per-connection lifecycle driver.
//!
//! Every accepted connection is owned by one task running [`ConnectionDriver`].
//! The task processes transport events, administrative commands and its own
//! timer (handshake deadline while handshaking, heartbeat timers while
//! active) strictly in arrival order, then tears down exactly once.

use crate::config::ServerConfig;
use crate::error::{CloseCause, RejectReason, ServerError};
use crate::events::{EventNotifier, ServerEvent};
use crate::handshake::{Binding, HandshakeMachine, HandshakeRequest};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::protocol::{self, FrameReader, PeerFrame};
use crate::transport::{Accepted, LinkCommand, LinkEvent};
use bytes::Bytes;
use dashmap::DashMap;
use socketeer_store::{ConnectionId, ReleaseOutcome, SessionId, SessionStore, StoreError};
use socketeer_wire::DEFAULT_MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Waiting for the handshake to complete
    Handshaking,
    /// Handshake done, heartbeat running
    Active,
    /// Tearing down
    Closing,
    /// Gone
    Closed,
}

/// Snapshot of a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id
    pub connection_id: ConnectionId,
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Bound session
    pub session_id: Option<SessionId>,
    /// When the last ping went out
    pub last_ping_sent_at: Option<Instant>,
    /// When the last matching pong came back
    pub last_pong_received_at: Option<Instant>,
    /// Most recent round trip time
    pub last_rtt: Option<Duration>,
}

impl ConnectionInfo {
    fn new(connection_id: ConnectionId, remote_addr: SocketAddr) -> Self {
        Self {
            connection_id,
            remote_addr,
            state: ConnectionState::Handshaking,
            session_id: None,
            last_ping_sent_at: None,
            last_pong_received_at: None,
            last_rtt: None,
        }
    }
}

/// Administrative request for a connection task
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Close {
        discard: bool,
    },
}

/// Registry entry of a live connection
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    pub(crate) commands: mpsc::UnboundedSender<ConnectionCommand>,
    info: watch::Receiver<ConnectionInfo>,
}

impl ConnectionHandle {
    pub(crate) fn info(&self) -> ConnectionInfo {
        self.info.borrow().clone()
    }
}

/// Live connections by id
pub(crate) type Registry = Arc<DashMap<ConnectionId, ConnectionHandle>>;

/// State shared by the server and every connection task
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) notifier: EventNotifier,
    pub(crate) registry: Registry,
}

/// Register an accepted connection and spawn its task
pub(crate) fn spawn_connection(shared: &Shared, accepted: Accepted) -> ConnectionId {
    let connection_id = ConnectionId::next();
    let Accepted { remote_addr, link } = accepted;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (info_tx, info_rx) = watch::channel(ConnectionInfo::new(connection_id, remote_addr));
    shared.registry.insert(
        connection_id,
        ConnectionHandle {
            commands: command_tx,
            info: info_rx,
        },
    );

    info!(connection_id = %connection_id, peer = %remote_addr, "Accepted connection");
    shared.notifier.publish(ServerEvent::ConnectionAccepted {
        connection_id,
        remote_addr,
    });

    let driver = ConnectionDriver::new(shared.clone(), connection_id, remote_addr, link.commands, info_tx);
    tokio::spawn(driver.run(link.events, command_rx));
    connection_id
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owner of one connection's state
pub(crate) struct ConnectionDriver {
    shared: Shared,
    connection_id: ConnectionId,
    remote_addr: SocketAddr,
    link: mpsc::UnboundedSender<LinkCommand>,
    info: watch::Sender<ConnectionInfo>,
    state: ConnectionState,
    handshake: HandshakeMachine,
    heartbeat: HeartbeatMonitor,
    reader: FrameReader,
    session_id: Option<SessionId>,
    next_msg_id: u64,
}

impl ConnectionDriver {
    fn new(
        shared: Shared,
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        link: mpsc::UnboundedSender<LinkCommand>,
        info: watch::Sender<ConnectionInfo>,
    ) -> Self {
        let handshake = HandshakeMachine::new(
            connection_id,
            remote_addr.ip(),
            shared.config.handshake_timeout,
        );
        let heartbeat = HeartbeatMonitor::new(
            shared.config.heartbeat_interval,
            shared.config.heartbeat_timeout,
        );

        Self {
            shared,
            connection_id,
            remote_addr,
            link,
            info,
            state: ConnectionState::Handshaking,
            handshake,
            heartbeat,
            reader: FrameReader::with_max_frame_size(protocol::CONTROL_FRAME_LIMIT),
            session_id: None,
            next_msg_id: 1,
        }
    }

    /// Run until the connection ends, then tear it down
    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<LinkEvent>,
        mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) {
        let cause = self.drive(&mut events, &mut commands).await;
        self.teardown(cause);
    }

    async fn drive(
        &mut self,
        events: &mut mpsc::Receiver<LinkEvent>,
        commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
    ) -> CloseCause {
        loop {
            let wake_at = self.next_deadline();

            tokio::select! {
                event = events.recv() => match event {
                    Some(LinkEvent::Data(chunk)) => {
                        if let Some(cause) = self.on_bytes(&chunk) {
                            return cause;
                        }
                    }
                    Some(LinkEvent::Closed) | None => {
                        debug!(connection_id = %self.connection_id, "Transport closed");
                        return CloseCause::TransportClosed;
                    }
                    Some(LinkEvent::Error(message)) => {
                        warn!(connection_id = %self.connection_id, "Transport error: {}", message);
                        self.shared.notifier.publish(ServerEvent::TransportError {
                            connection_id: Some(self.connection_id),
                            message: message.clone(),
                        });
                        return CloseCause::TransportError(message);
                    }
                },
                command = commands.recv() => match command {
                    Some(ConnectionCommand::Send { payload, reply }) => {
                        let _ = reply.send(self.send_data(payload));
                    }
                    Some(ConnectionCommand::Close { discard }) => {
                        return CloseCause::ServerClosed { discard };
                    }
                    None => return CloseCause::ServerClosed { discard: false },
                },
                _ = wait_until(wake_at) => {
                    if let Some(cause) = self.on_timer(Instant::now()) {
                        return cause;
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Handshaking => self.handshake.deadline(),
            ConnectionState::Active => self.heartbeat.next_deadline(),
            ConnectionState::Closing | ConnectionState::Closed => None,
        }
    }

    fn on_timer(&mut self, now: Instant) -> Option<CloseCause> {
        match self.state {
            ConnectionState::Handshaking => {
                let reason = self.handshake.on_deadline(now)?;
                Some(self.reject(reason))
            }
            ConnectionState::Active => match self.heartbeat.on_timer(now) {
                HeartbeatAction::SendPing(corr_id) => {
                    trace!(connection_id = %self.connection_id, corr_id, "Sending ping");
                    self.write(protocol::build_ping(corr_id));
                    self.info.send_modify(|info| info.last_ping_sent_at = Some(now));
                    None
                }
                HeartbeatAction::TimedOut => {
                    warn!(
                        connection_id = %self.connection_id,
                        "No pong within {:?}, closing",
                        self.shared.config.heartbeat_timeout
                    );
                    self.shared.notifier.publish(ServerEvent::HeartbeatTimeout {
                        connection_id: self.connection_id,
                        session_id: self.session_id.clone(),
                    });
                    Some(CloseCause::HeartbeatTimeout)
                }
                HeartbeatAction::Idle => None,
            },
            ConnectionState::Closing | ConnectionState::Closed => None,
        }
    }

    fn on_bytes(&mut self, chunk: &[u8]) -> Option<CloseCause> {
        self.reader.push(chunk);
        loop {
            let frame = match self.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(e) => {
                    warn!(connection_id = %self.connection_id, "Undecodable frame: {}", e);
                    return Some(self.violation());
                }
            };

            let frame = match PeerFrame::from_frame(frame) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(connection_id = %self.connection_id, "Malformed frame: {}", e);
                    return Some(self.violation());
                }
            };

            if let Some(cause) = self.on_frame(frame) {
                return Some(cause);
            }
        }
    }

    fn on_frame(&mut self, frame: PeerFrame) -> Option<CloseCause> {
        match (self.state, frame) {
            (ConnectionState::Handshaking, PeerFrame::Hello) => {
                self.on_handshake_request(HandshakeRequest::NewSession)
            }
            (ConnectionState::Handshaking, PeerFrame::Resume(session_id)) => {
                self.on_handshake_request(HandshakeRequest::ResumeSession(session_id))
            }
            (ConnectionState::Active, PeerFrame::Data { msg_id, payload }) => {
                self.shared.notifier.publish(ServerEvent::MessageReceived {
                    connection_id: self.connection_id,
                    session_id: self.session_id.clone(),
                    msg_id,
                    payload,
                });
                None
            }
            (ConnectionState::Active, PeerFrame::Ping(corr_id)) => {
                self.write(protocol::build_pong(corr_id));
                None
            }
            (ConnectionState::Active, PeerFrame::Pong(corr_id)) => {
                let now = Instant::now();
                match self.heartbeat.on_pong(corr_id, now) {
                    Some(rtt) => {
                        trace!(connection_id = %self.connection_id, corr_id, "Pong after {:?}", rtt);
                        self.info.send_modify(|info| {
                            info.last_pong_received_at = Some(now);
                            info.last_rtt = Some(rtt);
                        });
                    }
                    None => {
                        debug!(connection_id = %self.connection_id, corr_id, "Ignoring unmatched pong")
                    }
                }
                None
            }
            (ConnectionState::Active, PeerFrame::Bye { end_session }) => {
                debug!(connection_id = %self.connection_id, end_session, "Peer said bye");
                Some(CloseCause::PeerBye {
                    discard: end_session,
                })
            }
            (state, frame) => {
                debug!(connection_id = %self.connection_id, ?state, ?frame, "Unexpected frame");
                Some(self.violation())
            }
        }
    }

    fn on_handshake_request(&mut self, request: HandshakeRequest) -> Option<CloseCause> {
        match self.handshake.on_request(request, &self.shared.store) {
            Ok(binding) => {
                self.activate(binding);
                None
            }
            Err(reason) => Some(self.reject(reason)),
        }
    }

    fn activate(&mut self, binding: Binding) {
        let now = Instant::now();
        let Binding { session, resumed } = binding;
        self.session_id = session.as_ref().map(|s| s.id.clone());

        self.heartbeat.start(now);
        self.reader.set_max_frame_size(DEFAULT_MAX_FRAME_SIZE);
        self.state = ConnectionState::Active;
        let session_id = self.session_id.clone();
        self.info.send_modify(|info| {
            info.state = ConnectionState::Active;
            info.session_id = session_id;
        });
        self.write(protocol::build_welcome(self.session_id.as_ref(), resumed));

        if let Some(session) = session {
            if resumed {
                info!(connection_id = %self.connection_id, session_id = %session.id, "Resumed session");
                self.shared.notifier.publish(ServerEvent::SessionResumed {
                    connection_id: self.connection_id,
                    session_id: session.id,
                    application_state: session.application_state,
                });
            } else {
                info!(connection_id = %self.connection_id, session_id = %session.id, "Created session");
                self.shared.notifier.publish(ServerEvent::SessionCreated {
                    connection_id: self.connection_id,
                    session_id: session.id,
                });
            }
        }

        self.shared.notifier.publish(ServerEvent::ConnectionActive {
            connection_id: self.connection_id,
            session_id: self.session_id.clone(),
        });
    }

    fn violation(&mut self) -> CloseCause {
        match self.state {
            ConnectionState::Handshaking => {
                let reason = self.handshake.on_violation();
                self.reject(reason)
            }
            _ => {
                self.write(protocol::build_reject(RejectReason::ProtocolViolation));
                CloseCause::ProtocolViolation
            }
        }
    }

    fn reject(&mut self, reason: RejectReason) -> CloseCause {
        info!(connection_id = %self.connection_id, peer = %self.remote_addr, "Rejecting handshake: {}", reason);
        self.write(protocol::build_reject(reason));
        self.shared.notifier.publish(ServerEvent::HandshakeRejected {
            connection_id: self.connection_id,
            reason,
        });
        CloseCause::Rejected(reason)
    }

    fn send_data(&mut self, payload: Bytes) -> Result<(), ServerError> {
        if self.state != ConnectionState::Active {
            return Err(ServerError::ConnectionNotActive(self.connection_id));
        }
        let frame = protocol::build_data(self.next_msg_id, payload)?;
        self.next_msg_id += 1;
        self.write(frame);
        Ok(())
    }

    fn write(&self, bytes: Bytes) {
        if self.link.send(LinkCommand::Send(bytes)).is_err() {
            debug!(connection_id = %self.connection_id, "Transport gone, dropping frame");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.info.send_modify(|info| info.state = state);
    }

    fn teardown(mut self, cause: CloseCause) {
        self.set_state(ConnectionState::Closing);
        self.heartbeat.stop();

        let mut session_resumable = false;
        if let Some(session_id) = self.session_id.clone() {
            match self
                .shared
                .store
                .release(&session_id, self.connection_id, cause.release_cause())
            {
                Ok(ReleaseOutcome::Resumable { .. }) => {
                    session_resumable = true;
                }
                Ok(ReleaseOutcome::Deleted) => {}
                Err(StoreError::SessionNotFound(_)) => {
                    debug!(connection_id = %self.connection_id, session_id = %session_id, "Session already discarded");
                }
                Err(error) => {
                    warn!(connection_id = %self.connection_id, "Failed to release session: {}", error);
                    self.shared.notifier.publish(ServerEvent::StoreError {
                        connection_id: Some(self.connection_id),
                        error,
                    });
                }
            }
        }

        if self.link.send(LinkCommand::Close).is_err() {
            trace!(connection_id = %self.connection_id, "Transport already gone");
        }
        self.set_state(ConnectionState::Closed);
        self.shared.registry.remove(&self.connection_id);

        info!(
            connection_id = %self.connection_id,
            peer = %self.remote_addr,
            "Connection closed: {}",
            cause
        );
        self.shared.notifier.publish(ServerEvent::ConnectionClosed {
            connection_id: self.connection_id,
            session_id: self.session_id.take(),
            cause,
            session_resumable,
        });
    }
}
