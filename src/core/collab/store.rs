//! Authoritative in-memory session table
//!
//! This module owns every session record and applies writes under the
//! session invariants:
//! - at most `max_sessions` records exist at once
//! - `updatedAt` never decreases and strictly advances on every accepted write
//! - `participants` never holds duplicates
//! - `version` increases by one per accepted write
//!
//! Each mutation runs inside a single DashMap shard lock, so writes to one
//! record are atomic with respect to each other. Admission of new records is
//! serialized separately so the capacity check and the insert cannot interleave.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::clock::ClockSyncService;
use super::conflict;
use super::error::SessionError;
use super::protocol::*;

// ============================================================================
// Constants
// ============================================================================

/// Default capacity of the store
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Name given to sessions created implicitly without one
pub const UNTITLED_SESSION: &str = "Untitled Session";

// ============================================================================
// Upsert Outcome
// ============================================================================

/// Result of an upsert: which branch ran, and the resulting record
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Session),
    Updated(Session),
}

impl UpsertOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn session(&self) -> &Session {
        match self {
            Self::Created(session) | Self::Updated(session) => session,
        }
    }

    pub fn into_session(self) -> Session {
        match self {
            Self::Created(session) | Self::Updated(session) => session,
        }
    }
}

// ============================================================================
// Session Store
// ============================================================================

pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    /// Serializes capacity check + insert
    admission: Mutex<()>,
    max_sessions: usize,
    clock: ClockSyncService,
}

impl SessionStore {
    pub fn new(max_sessions: usize, clock: ClockSyncService) -> Self {
        Self {
            sessions: DashMap::new(),
            admission: Mutex::new(()),
            max_sessions,
            clock,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn clock(&self) -> &ClockSyncService {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, id: &str) -> Result<Session, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// All sessions, most recently updated first; ties broken by id
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create a session with a fresh id; the creator is its first participant
    pub fn create(&self, draft: SessionDraft) -> Result<Session, SessionError> {
        self.create_then(draft, |_| {})
    }

    /// [`Self::create`], running `on_commit` before any other writer can reach
    /// the new record
    pub fn create_then(
        &self,
        draft: SessionDraft,
        on_commit: impl FnOnce(&Session),
    ) -> Result<Session, SessionError> {
        let _admission = self.admit();
        self.ensure_capacity()?;

        let mut id = Uuid::new_v4().to_string();
        while self.sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let now = self.clock.now();
        let mut session = blank_session(id, draft.name, draft.created_by, now);
        session.creator_name = draft.creator_name;
        session.participants = vec![session.created_by.clone()];

        let mut params = draft.params;
        params.participants = None;
        apply_patch(&mut session, params);

        let entry = self.sessions.entry(session.id.clone()).or_insert(session);
        on_commit(entry.value());
        Ok(entry.value().clone())
    }

    /// Add `user_id` to the participants (if absent) and advance `updatedAt`
    pub fn join(&self, id: &str, user_id: &str) -> Result<Session, SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if !entry.has_participant(user_id) {
            entry.participants.push(user_id.to_string());
        }
        advance(&mut entry, self.clock.now());
        Ok(entry.value().clone())
    }

    /// Create the session if absent, otherwise shallow-merge `patch` into it
    pub fn upsert(&self, id: &str, patch: SessionPatch) -> Result<UpsertOutcome, SessionError> {
        if let Some(session) = self.merge_existing(id, &patch) {
            return Ok(UpsertOutcome::Updated(session));
        }

        let _admission = self.admit();
        // Another writer may have created it while we waited for admission
        if let Some(session) = self.merge_existing(id, &patch) {
            return Ok(UpsertOutcome::Updated(session));
        }
        self.ensure_capacity()?;

        let mut patch = patch;
        let now = self.clock.now();
        let created_by = non_blank(patch.created_by.clone()).unwrap_or_default();
        let mut session =
            blank_session(id.to_string(), UNTITLED_SESSION.to_string(), created_by, now);
        session.creator_name = patch.creator_name.clone();

        // The creator is always the first participant
        let mut participants = Vec::new();
        if !session.created_by.is_empty() {
            participants.push(session.created_by.clone());
        }
        participants.extend(patch.participants.take().unwrap_or_default());
        session.participants = dedup_preserving_order(participants);
        apply_patch(&mut session, patch);

        self.sessions.insert(session.id.clone(), session.clone());
        Ok(UpsertOutcome::Created(session))
    }

    /// Merge `patch` only if `client_timestamp` is newer than the stored `updatedAt`
    ///
    /// On success `updatedAt` becomes `client_timestamp`. A stale write leaves
    /// the record untouched.
    pub fn patch_with_conflict_check(
        &self,
        id: &str,
        patch: SessionPatch,
        client_timestamp: Millis,
    ) -> Result<Session, SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        conflict::ensure_newer(entry.updated_at, client_timestamp)?;

        apply_patch(&mut entry, patch);
        entry.updated_at = client_timestamp;
        entry.version += 1;
        Ok(entry.value().clone())
    }

    /// Merge `patch`, conflict-checked only when the client supplied a timestamp
    ///
    /// Without one the server orders the write itself, so it always wins:
    /// `updatedAt` becomes `max(now, stored + 1)`.
    pub fn patch_ordered(
        &self,
        id: &str,
        patch: SessionPatch,
        client_timestamp: Option<Millis>,
    ) -> Result<Session, SessionError> {
        if let Some(timestamp) = client_timestamp {
            return self.patch_with_conflict_check(id, patch, timestamp);
        }

        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        apply_patch(&mut entry, patch);
        advance(&mut entry, self.clock.now());
        Ok(entry.value().clone())
    }

    pub fn delete(&self, id: &str) -> Result<Session, SessionError> {
        self.sessions
            .remove(id)
            .map(|(_, session)| session)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn admit(&self) -> MutexGuard<'_, ()> {
        self.admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_capacity(&self) -> Result<(), SessionError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::CapacityExceeded {
                max: self.max_sessions,
            });
        }
        Ok(())
    }

    fn merge_existing(&self, id: &str, patch: &SessionPatch) -> Option<Session> {
        let mut entry = self.sessions.get_mut(id)?;
        apply_patch(&mut entry, patch.clone());
        advance(&mut entry, self.clock.now());
        Some(entry.value().clone())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS, ClockSyncService::default())
    }
}

// ============================================================================
// Record Helpers
// ============================================================================

fn blank_session(id: SessionId, name: String, created_by: UserId, now: Millis) -> Session {
    Session {
        id,
        name,
        created_by,
        creator_name: None,
        participants: Vec::new(),
        tag_user_params: Value::Object(Map::new()),
        faq_user_params: Value::Object(Map::new()),
        company_info: None,
        user_params: None,
        created_at: now,
        updated_at: now,
        version: 1,
        extra: Map::new(),
    }
}

/// Strictly advance `updatedAt` for writes that carry no client timestamp
fn advance(session: &mut Session, now: Millis) {
    session.updated_at = now.max(session.updated_at.saturating_add(1));
    session.version += 1;
}

/// Shallow merge; nested documents are replaced wholesale, identity fields are ignored
fn apply_patch(session: &mut Session, patch: SessionPatch) {
    if let Some(name) = non_blank(patch.name) {
        session.name = name;
    }
    if let Some(participants) = patch.participants {
        session.participants = dedup_preserving_order(participants);
    }
    if let Some(tag_user_params) = patch.tag_user_params {
        session.tag_user_params = tag_user_params;
    }
    if let Some(faq_user_params) = patch.faq_user_params {
        session.faq_user_params = faq_user_params;
    }
    if let Some(company_info) = patch.company_info {
        session.company_info = Some(company_info);
    }
    if let Some(user_params) = patch.user_params {
        session.user_params = Some(user_params);
    }
    for (key, value) in patch.extra {
        if !SESSION_FIELDS.contains(&key.as_str()) {
            session.extra.insert(key, value);
        }
    }
}

fn dedup_preserving_order(users: Vec<UserId>) -> Vec<UserId> {
    let mut seen = HashSet::new();
    users
        .into_iter()
        .filter(|user| seen.insert(user.clone()))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
