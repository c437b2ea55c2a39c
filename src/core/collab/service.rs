//! Orchestration between the session store, presence and room broadcasts
//!
//! Both transports (REST handlers and the push channel) call into
//! [`SessionService`]. Every successful mutation publishes the resulting record
//! to the session's room; a failed one publishes nothing.
//!
//! A mutation and the publish of its result run under the session's sequencer
//! stripe, so every room observes records and presence changes in commit
//! order. Lock order is sequencer, then store admission, then store shard.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::broadcast::{Audience, BroadcastRouter};
use super::clock::ClockSyncService;
use super::error::SessionError;
use super::presence::{Departure, Identity, PresenceRegistry};
use super::protocol::*;
use super::store::SessionStore;

const SEQUENCER_STRIPES: usize = 64;

/// What a freshly attached connection needs to render the session
#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    pub identity: Identity,
    pub active_users: Vec<OnlineUser>,
    /// Current record, if the session exists
    pub session: Option<Session>,
}

/// Striped per-session ordering lock
struct Sequencer {
    stripes: Vec<Mutex<()>>,
}

impl Sequencer {
    fn new() -> Self {
        Self {
            stripes: (0..SEQUENCER_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Never hold two stripes at once
    fn lock(&self, session_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct SessionService {
    store: Arc<SessionStore>,
    presence: Arc<PresenceRegistry>,
    router: Arc<dyn BroadcastRouter>,
    clock: ClockSyncService,
    sequencer: Sequencer,
}

impl SessionService {
    pub fn new(
        store: Arc<SessionStore>,
        presence: Arc<PresenceRegistry>,
        router: Arc<dyn BroadcastRouter>,
    ) -> Self {
        let clock = store.clock().clone();
        Self {
            store,
            presence,
            router,
            clock,
            sequencer: Sequencer::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Server clock reading for client calibration
    pub fn server_time(&self) -> Millis {
        self.clock.now()
    }

    // ========================================================================
    // Request/response operations
    // ========================================================================

    pub fn create_session(&self, body: SessionPatch) -> Result<Session, SessionError> {
        let draft = SessionDraft::from_patch(body)?;
        // The id is unknown until commit, so publish from inside the store
        let session = self
            .store
            .create_then(draft, |session| self.publish_update(session, Audience::Everyone))?;

        tracing::info!(
            session_id = %session.id,
            created_by = %session.created_by,
            "Session created"
        );
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        self.store.get(id)
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.store.list()
    }

    pub fn session_exists(&self, id: &str) -> bool {
        self.store.contains(id)
    }

    pub fn join_session(&self, id: &str, request: JoinRequest) -> Result<Session, SessionError> {
        let user_id =
            non_blank(request.user_id).ok_or_else(|| SessionError::validation("userId is required"))?;

        let _sequence = self.sequencer.lock(id);
        let session = self.store.join(id, &user_id)?;

        tracing::info!(
            session_id = %id,
            user_id = %user_id,
            username = ?request.username,
            "User joined session"
        );
        self.publish_update(&session, Audience::Everyone);
        Ok(session)
    }

    /// Create-or-merge by id
    pub fn upsert_session(&self, id: &str, patch: SessionPatch) -> Result<Session, SessionError> {
        let _sequence = self.sequencer.lock(id);
        let outcome = self.store.upsert(id, patch)?;
        if outcome.is_created() {
            tracing::info!(session_id = %id, "Session created by upsert");
        }

        let session = outcome.into_session();
        self.publish_update(&session, Audience::Everyone);
        Ok(session)
    }

    pub fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        let _sequence = self.sequencer.lock(id);
        self.store.delete(id)?;

        tracing::info!(session_id = %id, "Session deleted");
        self.router.publish(
            id,
            ServerMessage::SessionDeleted { id: id.to_string() },
            Audience::Everyone,
        );
        Ok(())
    }

    // ========================================================================
    // Push-channel operations
    // ========================================================================

    /// Attach a connection: presence, room subscription and participation
    pub fn connect(
        &self,
        connection: ConnectionId,
        params: ConnectParams,
    ) -> Result<Connected, SessionError> {
        let stripe_key = params.session_id.clone().unwrap_or_default();
        let _sequence = self.sequencer.lock(&stripe_key);

        let attachment = self.presence.attach(connection, params)?;
        let identity = attachment.identity;
        let session_id = identity.session_id.as_str();

        self.router.subscribe(connection, session_id);
        tracing::info!(
            session_id = %session_id,
            user_id = %identity.user.user_id,
            connection_id = %connection,
            "Connection attached"
        );

        if attachment.first_for_user {
            self.router.publish(
                session_id,
                ServerMessage::UserJoined(identity.user.clone()),
                Audience::ExceptSender(connection),
            );
        }

        let session = self.record_participation(connection, &identity);

        Ok(Connected {
            active_users: self.presence.list_online(session_id),
            session,
            identity,
        })
    }

    /// Detach a connection; idempotent
    pub fn disconnect(&self, connection: &ConnectionId) -> Option<Departure> {
        let attached = self.presence.identity(connection)?;
        let _sequence = self.sequencer.lock(&attached.session_id);

        let departure = self.presence.detach(connection)?;
        let session_id = departure.identity.session_id.as_str();

        self.router.unsubscribe(*connection, session_id);
        tracing::info!(
            session_id = %session_id,
            user_id = %departure.identity.user.user_id,
            connection_id = %connection,
            "Connection detached"
        );

        if departure.last_for_user {
            self.router.publish(
                session_id,
                ServerMessage::UserLeft(departure.identity.user.clone()),
                Audience::Everyone,
            );
        }
        Some(departure)
    }

    /// Conflict-checked whole-record patch
    pub fn update_session(
        &self,
        sender: ConnectionId,
        payload: UpdateSessionPayload,
    ) -> Result<Session, SessionError> {
        let _sequence = self.sequencer.lock(&payload.id);
        let session = self
            .store
            .patch_with_conflict_check(&payload.id, payload.patch, payload.updated_at)
            .inspect_err(|e| log_rejected(&payload.id, sender, e))?;

        self.publish_update(&session, Audience::ExceptSender(sender));
        Ok(session)
    }

    /// Replace the authorization parameter documents
    ///
    /// A client `updatedAt` makes this a conflict-checked write like
    /// [`Self::update_session`]. Without one the server orders the write and
    /// it always lands, however far ahead other clients' clocks are.
    pub fn auth_update(
        &self,
        sender: ConnectionId,
        payload: AuthUpdatePayload,
    ) -> Result<Session, SessionError> {
        let AuthUpdatePayload {
            session_id,
            auth_data,
        } = payload;
        let patch = SessionPatch::params(auth_data.tag_user_params, auth_data.faq_user_params);

        let _sequence = self.sequencer.lock(&session_id);
        let session = self
            .store
            .patch_ordered(&session_id, patch, auth_data.updated_at)
            .inspect_err(|e| log_rejected(&session_id, sender, e))?;

        self.publish_update(&session, Audience::ExceptSender(sender));
        Ok(session)
    }

    /// Relay a chat-style message to everyone else in the sender's room
    pub fn send_message(
        &self,
        sender: ConnectionId,
        text: String,
    ) -> Result<ChatMessage, SessionError> {
        let identity = self
            .presence
            .identity(&sender)
            .ok_or(SessionError::MissingIdentity)?;
        if text.trim().is_empty() {
            return Err(SessionError::validation("message text is empty"));
        }

        let message = ChatMessage {
            user_id: identity.user.user_id,
            username: identity.user.username,
            text,
            sent_at: self.clock.now(),
        };
        let _sequence = self.sequencer.lock(&identity.session_id);
        self.router.publish(
            &identity.session_id,
            ServerMessage::ChatMessage(message.clone()),
            Audience::ExceptSender(sender),
        );
        Ok(message)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn publish_update(&self, session: &Session, audience: Audience) {
        self.router.publish(
            &session.id,
            ServerMessage::SessionUpdated(session.clone()),
            audience,
        );
    }

    /// Join the connecting user to an existing session they are not part of yet
    ///
    /// Runs under the caller's sequencer stripe.
    fn record_participation(&self, connection: ConnectionId, identity: &Identity) -> Option<Session> {
        let session = self.store.get(&identity.session_id).ok()?;
        if session.has_participant(&identity.user.user_id) {
            return Some(session);
        }

        let joined = self.store.join(&identity.session_id, &identity.user.user_id).ok()?;
        self.publish_update(&joined, Audience::ExceptSender(connection));
        Some(joined)
    }
}

fn log_rejected(session_id: &str, sender: ConnectionId, err: &SessionError) {
    tracing::warn!(
        session_id = %session_id,
        connection_id = %sender,
        reason = err.reason(),
        "Rejected session write: {}",
        err
    );
}
