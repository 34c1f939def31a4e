//! Concurrent session map with expiry and single-owner binding.

use crate::{
    ConnectionId, ReleaseCause, ReleaseOutcome, Session, SessionId, StoreConfig, StoreError,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// In-process session store.
///
/// Every mutation goes through a DashMap entry, so the lookup and the
/// update of a single session happen under the same shard lock.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    config: StoreConfig,
}

impl SessionStore {
    /// Create an empty store
    pub fn new(config: StoreConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether the store hands out sessions at all
    pub fn supports_resuming(&self) -> bool {
        self.config.supports_resuming
    }

    /// Create a fresh, unbound session
    pub fn create(
        &self,
        origin_ip: IpAddr,
        application_state: serde_json::Value,
    ) -> Result<Session, StoreError> {
        if !self.config.supports_resuming {
            return Err(StoreError::ResumingDisabled);
        }

        let now = Instant::now();
        let session = Session {
            id: SessionId::generate(),
            created_at: now,
            last_active_at: now,
            expires_at: now + self.config.max_session_age,
            origin_ip,
            bound_connection: None,
            application_state,
        };

        self.sessions.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, origin = %origin_ip, "Created session");
        Ok(session)
    }

    /// Bind an existing session to a connection.
    ///
    /// Fails without side effects unless the session is idle, unexpired and,
    /// when IP binding is enforced, requested from its origin address. An
    /// expired session is evicted on the spot.
    pub fn claim(
        &self,
        session_id: &SessionId,
        requester_ip: IpAddr,
        connection_id: ConnectionId,
    ) -> Result<Session, StoreError> {
        let now = Instant::now();

        let mut entry = match self.sessions.entry(session_id.clone()) {
            Entry::Vacant(_) => return Err(StoreError::SessionNotFound(session_id.clone())),
            Entry::Occupied(entry) => entry,
        };

        let session = entry.get();
        if let Some(owner) = session.bound_connection {
            return Err(StoreError::SessionAlreadyBound {
                session_id: session_id.clone(),
                owner,
            });
        }

        if session.is_expired(now) {
            entry.remove();
            info!(session_id = %session_id, "Evicted expired session on claim");
            return Err(StoreError::SessionExpired(session_id.clone()));
        }

        if !self.config.resume_allows_different_ips && session.origin_ip != requester_ip {
            return Err(StoreError::IpMismatch {
                session_id: session_id.clone(),
                origin: session.origin_ip,
                requester: requester_ip,
            });
        }

        let session = entry.get_mut();
        session.bound_connection = Some(connection_id);
        session.last_active_at = now;
        debug!(session_id = %session_id, connection_id = %connection_id, "Claimed session");
        Ok(session.clone())
    }

    /// Give a session back when its connection ends.
    ///
    /// The session stays resumable for `max_session_age` unless resuming is
    /// disabled or the cause asks for it to be discarded.
    pub fn release(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        cause: ReleaseCause,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut entry = match self.sessions.entry(session_id.clone()) {
            Entry::Vacant(_) => return Err(StoreError::SessionNotFound(session_id.clone())),
            Entry::Occupied(entry) => entry,
        };

        if entry.get().bound_connection != Some(connection_id) {
            return Err(StoreError::NotOwner {
                session_id: session_id.clone(),
                connection_id,
            });
        }

        if !self.config.supports_resuming || cause == ReleaseCause::Discard {
            entry.remove();
            debug!(session_id = %session_id, ?cause, "Deleted session on release");
            return Ok(ReleaseOutcome::Deleted);
        }

        let now = Instant::now();
        let session = entry.get_mut();
        session.bound_connection = None;
        session.last_active_at = now;
        session.expires_at = now + self.config.max_session_age;
        debug!(
            session_id = %session_id,
            ?cause,
            "Released session, resumable for {:?}",
            self.config.max_session_age
        );
        Ok(ReleaseOutcome::Resumable {
            expires_at: session.expires_at,
        })
    }

    /// Explicitly delete a session, bound or not
    pub fn discard(&self, session_id: &SessionId) -> Option<Session> {
        let removed = self.sessions.remove(session_id).map(|(_, session)| session);
        if removed.is_some() {
            debug!(session_id = %session_id, "Discarded session");
        }
        removed
    }

    /// Replace the application state of a session owned by `connection_id`
    pub fn update_state(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        application_state: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;

        if session.bound_connection != Some(connection_id) {
            return Err(StoreError::NotOwner {
                session_id: session_id.clone(),
                connection_id,
            });
        }

        session.application_state = application_state;
        Ok(())
    }

    /// Look up a session snapshot, evicting it if it has expired
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        let now = Instant::now();
        let removed = self
            .sessions
            .remove_if(session_id, |_, session| session.is_expired(now));
        if removed.is_some() {
            debug!(session_id = %session_id, "Evicted expired session on lookup");
            return None;
        }
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Delete every idle session past its expiry, returning how many went
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            info!("Swept {} expired sessions", evicted);
        }
        evicted
    }

    /// Number of sessions currently held, bound or idle
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Periodically sweep expired sessions until the task is aborted
    pub async fn run_sweeper(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_expired();
        }
    }
}
