//! Registry of live charge point sessions
//!
//! Membership only: the acceptor adds a session when its connection is
//! accepted and removes it on teardown. Nothing is ever sent through the
//! registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::ocpp::ChargePointId;

/// Per-connection key, distinct even when two connections share a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the registry knows about a live session
#[derive(Debug, Clone)]
pub struct RegisteredSession {
    pub identity: ChargePointId,
    pub subprotocol: String,
    pub connected_at: DateTime<Utc>,
}

impl RegisteredSession {
    /// Time since the connection was accepted
    pub fn connected_for(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }
}

/// Process-wide set of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, RegisteredSession>>,
}

/// Shared, reference-counted session registry
pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSessionRegistry {
        Arc::new(Self::new())
    }

    /// Add a session, returning the new size
    pub fn add(&self, id: SessionId, identity: ChargePointId, subprotocol: impl Into<String>) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.insert(
            id,
            RegisteredSession {
                identity,
                subprotocol: subprotocol.into(),
                connected_at: Utc::now(),
            },
        );
        sessions.len()
    }

    /// Remove a session, returning the remaining size
    ///
    /// Removing an id that is not registered leaves the registry unchanged.
    pub fn remove(&self, id: SessionId) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.remove(&id);
        sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<RegisteredSession> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Identities of every live session, sorted
    pub fn identities(&self) -> Vec<ChargePointId> {
        let mut ids: Vec<_> = self
            .sessions
            .lock()
            .values()
            .map(|s| s.identity.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}
