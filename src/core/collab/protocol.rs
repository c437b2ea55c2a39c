//! Wire types for the session service
//!
//! This module defines the shared session record, the patch shape used by every
//! mutation path, the REST DTOs and the push-channel messages exchanged between
//! clients and server. All JSON field names are camelCase.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ============================================================================
// Type Aliases
// ============================================================================

/// Opaque session identifier
pub type SessionId = String;

/// Opaque user identifier, supplied by the external identity provider
pub type UserId = String;

/// Milliseconds since the Unix epoch
pub type Millis = i64;

/// Identifier of one live push-channel connection
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// Wire names of the typed session fields; free-form extras may not use them
pub const SESSION_FIELDS: &[&str] = &[
    "id",
    "name",
    "createdBy",
    "creatorName",
    "participants",
    "tagUserParams",
    "faqUserParams",
    "companyInfo",
    "userParams",
    "createdAt",
    "updatedAt",
    "version",
];

fn empty_document() -> Value {
    Value::Object(Map::new())
}

/// The shared record that session participants view and edit together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created_by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_name: Option<String>,
    /// Users currently or previously associated with the session, without duplicates
    pub participants: Vec<UserId>,
    #[serde(default = "empty_document")]
    pub tag_user_params: Value,
    #[serde(default = "empty_document")]
    pub faq_user_params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_params: Option<Value>,
    pub created_at: Millis,
    pub updated_at: Millis,
    /// Server-assigned counter, incremented once per accepted write
    pub version: u64,
    /// Any further top-level fields clients chose to store
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

/// Partial session document; absent fields are left untouched on merge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Only used when the patch creates the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    /// Only used when the patch creates the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_user_params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faq_user_params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_params: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionPatch {
    /// Patch touching only the two independently-updatable parameter documents
    pub fn params(tag_user_params: Option<Value>, faq_user_params: Option<Value>) -> Self {
        Self {
            tag_user_params,
            faq_user_params,
            ..Default::default()
        }
    }
}

/// Validated input for an explicit session creation
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDraft {
    pub name: String,
    pub created_by: UserId,
    pub creator_name: Option<String>,
    pub params: SessionPatch,
}

impl SessionDraft {
    /// Build a draft from a creation body; `name` and `createdBy` are required
    pub fn from_patch(mut patch: SessionPatch) -> Result<Self, super::SessionError> {
        let name = non_blank(patch.name.take())
            .ok_or_else(|| super::SessionError::validation("name is required"))?;
        let created_by = non_blank(patch.created_by.take())
            .ok_or_else(|| super::SessionError::validation("createdBy is required"))?;
        let creator_name = patch.creator_name.take();

        Ok(Self {
            name,
            created_by,
            creator_name,
            params: patch,
        })
    }
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Presence
// ============================================================================

/// A user currently connected to a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: UserId,
    pub username: String,
}

// ============================================================================
// REST API DTOs
// ============================================================================

/// Body of `POST /sessions/{id}/join`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Response of `GET /sessions/{id}/exists`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

/// Query parameters supplied when opening the push channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub username: Option<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: ApiErrorCode,
}

impl ApiError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: ApiErrorCode::Forbidden,
        }
    }
}

/// API error codes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
    SessionNotFound,
    CapacityExceeded,
    Stale,
    Forbidden,
    BadRequest,
}

// ============================================================================
// Push Channel Messages
// ============================================================================

/// Payload of `updateSession`: target id, client timestamp and the fields to merge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionPayload {
    pub id: SessionId,
    pub updated_at: Millis,
    #[serde(flatten)]
    pub patch: SessionPatch,
}

/// Authorization parameters pushed by a client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_user_params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faq_user_params: Option<Value>,
    /// Client timestamp; absent means the server orders the write and it always lands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Millis>,
}

/// Payload of `auth_update`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUpdatePayload {
    pub session_id: SessionId,
    pub auth_data: AuthData,
}

/// Client-to-server push-channel messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    /// Ask for the server clock (acknowledged)
    #[serde(rename = "getServerTime")]
    GetServerTime,

    /// Conflict-checked patch of the whole record (acknowledged)
    #[serde(rename = "updateSession")]
    UpdateSession(UpdateSessionPayload),

    /// Replace the authorization parameter documents (fire-and-forget)
    #[serde(rename = "auth_update")]
    AuthUpdate(AuthUpdatePayload),

    /// Detach this connection from its session
    #[serde(rename = "leaveSession")]
    LeaveSession,

    /// Chat-style message to everyone else in the room
    #[serde(rename = "sendMessage")]
    SendMessage { text: String },

    #[serde(rename = "ping")]
    Ping,
}

/// Acknowledgement id carried next to a client message
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct FrameHeader {
    #[serde(default)]
    pub ack: Option<u64>,
}

/// Chat-style message relayed to a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub user_id: UserId,
    pub username: String,
    pub text: String,
    pub sent_at: Millis,
}

/// Acknowledgement of `getServerTime`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeAck {
    pub server_time: Millis,
}

/// Acknowledgement of `updateSession`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl UpdateAck {
    pub fn accepted(session: Session) -> Self {
        Self {
            success: true,
            session: Some(session),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            session: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AckResponse {
    ServerTime(ServerTimeAck),
    Update(UpdateAck),
}

/// Error codes sent in `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsErrorCode {
    InvalidMessage,
    NotAttached,
    NotFound,
    Stale,
    Validation,
    Capacity,
}

impl From<&super::SessionError> for WsErrorCode {
    fn from(err: &super::SessionError) -> Self {
        use super::SessionError;
        match err {
            SessionError::NotFound(_) => Self::NotFound,
            SessionError::Stale { .. } => Self::Stale,
            SessionError::CapacityExceeded { .. } => Self::Capacity,
            SessionError::MissingIdentity => Self::NotAttached,
            SessionError::Validation(_) => Self::Validation,
        }
    }
}

/// Server-to-client push-channel messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full record after an accepted mutation
    SessionUpdated(Session),

    SessionDeleted { id: SessionId },

    /// First connection of a user attached to the session
    UserJoined(OnlineUser),

    /// Last connection of a user detached from the session
    UserLeft(OnlineUser),

    /// Presence snapshot, sent once on connect
    ActiveUsers { users: Vec<OnlineUser> },

    ChatMessage(ChatMessage),

    /// Reply to a client message that carried an `ack` id
    Ack { id: u64, response: AckResponse },

    Error { code: WsErrorCode, message: String },

    Pong,
}

impl ServerMessage {
    /// Create an error message
    pub fn error(code: WsErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Event name as seen on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SessionUpdated(_) => "sessionUpdated",
            Self::SessionDeleted { .. } => "sessionDeleted",
            Self::UserJoined(_) => "userJoined",
            Self::UserLeft(_) => "userLeft",
            Self::ActiveUsers { .. } => "activeUsers",
            Self::ChatMessage(_) => "chatMessage",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}
