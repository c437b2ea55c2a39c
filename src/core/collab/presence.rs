//! Presence tracking: which connection belongs to which user in which session
//!
//! A user may hold several connections to the same session (multiple tabs).
//! The user counts as online while at least one of them is attached; only the
//! first attach and the last detach of a `(session, user)` pair are reported
//! as presence changes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::error::SessionError;
use super::protocol::*;

/// Identity a connection presents in its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_id: SessionId,
    pub user: OnlineUser,
}

impl Identity {
    /// `sessionId` and `userId` are required; `username` falls back to the user id
    pub fn from_params(params: ConnectParams) -> Result<Self, SessionError> {
        let session_id = non_blank(params.session_id).ok_or(SessionError::MissingIdentity)?;
        let user_id = non_blank(params.user_id).ok_or(SessionError::MissingIdentity)?;
        let username = non_blank(params.username).unwrap_or_else(|| user_id.clone());

        Ok(Self {
            session_id,
            user: OnlineUser { user_id, username },
        })
    }
}

/// Result of attaching a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub identity: Identity,
    /// No other connection of this user was attached to the session
    pub first_for_user: bool,
}

/// Result of detaching a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub identity: Identity,
    /// This was the user's last connection to the session
    pub last_for_user: bool,
}

#[derive(Default)]
struct PresenceState {
    connections: HashMap<ConnectionId, Identity>,
    open_per_user: HashMap<(SessionId, UserId), usize>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    state: Mutex<PresenceState>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under the session named in its handshake
    pub fn attach(
        &self,
        connection: ConnectionId,
        params: ConnectParams,
    ) -> Result<Attachment, SessionError> {
        let identity = Identity::from_params(params)?;
        let mut state = self.lock();

        if state.connections.contains_key(&connection) {
            return Err(SessionError::validation("connection is already attached"));
        }

        let key = (identity.session_id.clone(), identity.user.user_id.clone());
        let open = state.open_per_user.entry(key).or_insert(0);
        *open += 1;
        let first_for_user = *open == 1;

        state.connections.insert(connection, identity.clone());

        Ok(Attachment {
            identity,
            first_for_user,
        })
    }

    /// Remove `connection`; returns `None` if it was not attached
    pub fn detach(&self, connection: &ConnectionId) -> Option<Departure> {
        let mut state = self.lock();
        let identity = state.connections.remove(connection)?;

        let key = (identity.session_id.clone(), identity.user.user_id.clone());
        let remaining = state
            .open_per_user
            .get(&key)
            .copied()
            .unwrap_or(0)
            .saturating_sub(1);
        let last_for_user = remaining == 0;
        if last_for_user {
            state.open_per_user.remove(&key);
        } else {
            state.open_per_user.insert(key, remaining);
        }

        Some(Departure {
            identity,
            last_for_user,
        })
    }

    /// Identity of an attached connection
    pub fn identity(&self, connection: &ConnectionId) -> Option<Identity> {
        self.lock().connections.get(connection).cloned()
    }

    /// Distinct users attached to `session_id`, sorted by user id
    pub fn list_online(&self, session_id: &str) -> Vec<OnlineUser> {
        let state = self.lock();
        state
            .connections
            .values()
            .filter(|identity| identity.session_id == session_id)
            .map(|identity| identity.user.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
