//! Handshake state machine.
//!
//! A new physical connection gets exactly one chance to ask for a session:
//! a HELLO for a new one or a RESUME for an idle one, before the handshake
//! deadline. The machine validates the request against the session store
//! and ends in `Bound` or `Rejected`.

use crate::error::RejectReason;
use socketeer_store::{ConnectionId, Session, SessionId, SessionStore};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for HELLO or RESUME
    AwaitingRequest,
    /// Request received, consulting the store
    Validating,
    /// Connection admitted
    Bound,
    /// Connection refused
    Rejected(RejectReason),
}

/// A classified handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRequest {
    /// Start a new logical session
    NewSession,
    /// Take over an idle session
    ResumeSession(SessionId),
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Bound session, none when resuming is disabled
    pub session: Option<Session>,
    /// Whether the session existed before this connection
    pub resumed: bool,
}

/// Per-connection handshake state machine
#[derive(Debug)]
pub struct HandshakeMachine {
    connection_id: ConnectionId,
    remote_ip: IpAddr,
    state: HandshakeState,
    deadline: Instant,
}

impl HandshakeMachine {
    /// Start a handshake whose deadline is `timeout` from now
    pub fn new(connection_id: ConnectionId, remote_ip: IpAddr, timeout: Duration) -> Self {
        Self {
            connection_id,
            remote_ip,
            state: HandshakeState::AwaitingRequest,
            deadline: Instant::now() + timeout,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Pending deadline, present only while waiting for a request
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            HandshakeState::AwaitingRequest => Some(self.deadline),
            _ => None,
        }
    }

    /// Handle the deadline timer.
    ///
    /// A fire before the deadline, or after the machine moved on, is ignored.
    pub fn on_deadline(&mut self, now: Instant) -> Option<RejectReason> {
        if self.state != HandshakeState::AwaitingRequest || now < self.deadline {
            return None;
        }
        info!(connection_id = %self.connection_id, "Handshake timed out");
        Some(self.reject(RejectReason::HandshakeTimeout))
    }

    /// Handle a frame that is not a valid handshake request
    pub fn on_violation(&mut self) -> RejectReason {
        match self.state {
            HandshakeState::Rejected(reason) => reason,
            _ => self.reject(RejectReason::ProtocolViolation),
        }
    }

    /// Validate a request against the store, binding the session on success.
    ///
    /// Only the first request is honoured; any later one is a protocol
    /// violation.
    pub fn on_request(
        &mut self,
        request: HandshakeRequest,
        store: &SessionStore,
    ) -> Result<Binding, RejectReason> {
        match self.state {
            HandshakeState::AwaitingRequest => {}
            HandshakeState::Rejected(reason) => return Err(reason),
            HandshakeState::Validating | HandshakeState::Bound => {
                debug!(connection_id = %self.connection_id, "Duplicate handshake request");
                return Err(self.reject(RejectReason::ProtocolViolation));
            }
        }

        self.state = HandshakeState::Validating;
        let result = match request {
            HandshakeRequest::NewSession => self.new_session(store),
            HandshakeRequest::ResumeSession(session_id) => self.resume_session(&session_id, store),
        };

        match result {
            Ok(binding) => {
                self.state = HandshakeState::Bound;
                Ok(binding)
            }
            Err(reason) => Err(self.reject(reason)),
        }
    }

    fn new_session(&self, store: &SessionStore) -> Result<Binding, RejectReason> {
        if !store.supports_resuming() {
            return Ok(Binding {
                session: None,
                resumed: false,
            });
        }

        let created = store.create(self.remote_ip, serde_json::Value::Null)?;
        let session = store.claim(&created.id, self.remote_ip, self.connection_id)?;
        Ok(Binding {
            session: Some(session),
            resumed: false,
        })
    }

    fn resume_session(
        &self,
        session_id: &SessionId,
        store: &SessionStore,
    ) -> Result<Binding, RejectReason> {
        if !store.supports_resuming() {
            return Err(RejectReason::ResumingNotSupported);
        }

        let session = store.claim(session_id, self.remote_ip, self.connection_id)?;
        Ok(Binding {
            session: Some(session),
            resumed: true,
        })
    }

    fn reject(&mut self, reason: RejectReason) -> RejectReason {
        self.state = HandshakeState::Rejected(reason);
        reason
    }
}
