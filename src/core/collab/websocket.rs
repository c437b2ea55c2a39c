//! WebSocket push channel for live session synchronization
//!
//! This module provides the push-channel endpoint for:
//! - Server clock calibration (`getServerTime`)
//! - Conflict-checked session updates (`updateSession`, `auth_update`)
//! - Room presence (`userJoined`, `userLeft`, `activeUsers`)
//!
//! WebSocket URL: ws(s)://{host}/ws?sessionId=..&userId=..&username=..
//!
//! Every frame is a JSON object `{"event": .., "data": .., "ack": ..}`. A client
//! message carrying an `ack` id gets an `ack` frame back with the same id.

use axum::{
    Json,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::api::CollabState;
use super::error::SessionError;
use super::presence::Identity;
use super::protocol::*;

// ============================================================================
// Constants
// ============================================================================

/// Channel buffer size for outgoing messages
const OUTGOING_BUFFER_SIZE: usize = 64;

// ============================================================================
// WebSocket Handler
// ============================================================================

/// WebSocket upgrade handler
///
/// Browsers always send `Origin`; requests without one (native clients) are
/// let through. The origin is checked before the upgrade handshake is.
pub async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<CollabState>,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        if !state.origins.allows(origin) {
            tracing::warn!(origin = %origin, "Rejected push channel from disallowed origin");
            return (
                StatusCode::FORBIDDEN,
                Json(ApiError::forbidden("Origin not allowed")),
            )
                .into_response();
        }
    }

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, params, state)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Close frame sent when the handshake identity is rejected
fn rejection_frame(err: &SessionError) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: err.to_string().into(),
    }))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, params: ConnectParams, state: CollabState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTGOING_BUFFER_SIZE);
    let mut session = ConnectionSession::new(tx, state);

    if let Err(e) = session.attach(params).await {
        tracing::warn!(
            connection_id = %session.connection,
            "Rejected push channel: {}",
            e
        );
        let _ = ws_sender.send(rejection_frame(&e)).await;
        return;
    }

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = &text;
                session.handle_text(text_str).await;
            }
            Ok(Message::Close(_)) => {
                tracing::info!(
                    connection_id = %session.connection,
                    "Client closed connection"
                );
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!(connection_id = %session.connection, "Ignoring binary frame");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                tracing::warn!(connection_id = %session.connection, "WebSocket error: {}", e);
                break;
            }
        }
    }

    tracing::info!(
        connection_id = %session.connection,
        attached = session.is_attached(),
        "WebSocket connection closed"
    );

    session.cleanup();
    send_task.abort();
}

// ============================================================================
// Connection Session
// ============================================================================

enum ConnectionState {
    /// Handshake not processed yet
    Unattached,
    Attached(Identity),
    /// Left the session or rejected at handshake
    Detached,
}

/// State for a single WebSocket connection
struct ConnectionSession {
    connection: ConnectionId,
    state: ConnectionState,
    /// Channel for sending messages to this client
    tx: mpsc::Sender<ServerMessage>,
    collab: CollabState,
}

impl ConnectionSession {
    fn new(tx: mpsc::Sender<ServerMessage>, collab: CollabState) -> Self {
        Self {
            connection: ConnectionId::new(),
            state: ConnectionState::Unattached,
            tx,
            collab,
        }
    }

    fn is_attached(&self) -> bool {
        matches!(self.state, ConnectionState::Attached(_))
    }

    /// Register with the room hub and attach under the handshake identity
    ///
    /// The new connection receives the presence snapshot followed by the
    /// current record, if the session exists.
    async fn attach(&mut self, params: ConnectParams) -> Result<(), SessionError> {
        self.collab.hub.register(self.connection, self.tx.clone());

        let connected = match self.collab.service.connect(self.connection, params) {
            Ok(connected) => connected,
            Err(e) => {
                self.collab.hub.release(&self.connection);
                self.state = ConnectionState::Detached;
                return Err(e);
            }
        };
        self.state = ConnectionState::Attached(connected.identity);

        self.send(ServerMessage::ActiveUsers {
            users: connected.active_users,
        })
        .await;
        if let Some(session) = connected.session {
            self.send(ServerMessage::SessionUpdated(session)).await;
        }
        Ok(())
    }

    /// Parse and dispatch one text frame; failures become `error` frames
    async fn handle_text(&mut self, text: &str) {
        let header: FrameHeader = serde_json::from_str(text).unwrap_or_default();

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => {
                if let Err(e) = self.handle_message(msg, header.ack).await {
                    tracing::debug!(
                        connection_id = %self.connection,
                        reason = e.reason(),
                        "Client message failed: {}",
                        e
                    );
                    self.send(ServerMessage::error(WsErrorCode::from(&e), e.to_string()))
                        .await;
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.connection, "Invalid message format: {}", e);
                // An acked frame always gets its ack
                self.reply(header.ack, AckResponse::Update(UpdateAck::rejected("validation")))
                    .await;
                self.send(ServerMessage::error(
                    WsErrorCode::InvalidMessage,
                    format!("Invalid message format: {}", e),
                ))
                .await;
            }
        }
    }

    /// Handle an incoming client message
    async fn handle_message(
        &mut self,
        msg: ClientMessage,
        ack: Option<u64>,
    ) -> Result<(), SessionError> {
        match msg {
            ClientMessage::GetServerTime => {
                let response = AckResponse::ServerTime(ServerTimeAck {
                    server_time: self.collab.service.server_time(),
                });
                self.reply(ack, response).await;
                Ok(())
            }

            ClientMessage::UpdateSession(payload) => {
                self.require_attached()?;
                let result = self.collab.service.update_session(self.connection, payload);
                match ack {
                    Some(_) => {
                        let response = match result {
                            Ok(session) => UpdateAck::accepted(session),
                            Err(e) => UpdateAck::rejected(e.reason()),
                        };
                        self.reply(ack, AckResponse::Update(response)).await;
                        Ok(())
                    }
                    // Without an ack id the only way to report a rejection is an error frame
                    None => result.map(|_| ()),
                }
            }

            ClientMessage::AuthUpdate(payload) => {
                self.require_attached()?;
                self.collab.service.auth_update(self.connection, payload)?;
                Ok(())
            }

            ClientMessage::LeaveSession => {
                self.leave();
                Ok(())
            }

            ClientMessage::SendMessage { text } => {
                self.require_attached()?;
                self.collab.service.send_message(self.connection, text)?;
                Ok(())
            }

            ClientMessage::Ping => {
                self.send(ServerMessage::Pong).await;
                Ok(())
            }
        }
    }

    /// Require an attached identity before processing a message
    fn require_attached(&self) -> Result<&Identity, SessionError> {
        match &self.state {
            ConnectionState::Attached(identity) => Ok(identity),
            _ => Err(SessionError::MissingIdentity),
        }
    }

    async fn reply(&self, ack: Option<u64>, response: AckResponse) {
        if let Some(id) = ack {
            self.send(ServerMessage::Ack { id, response }).await;
        }
    }

    async fn send(&self, msg: ServerMessage) {
        if self.tx.send(msg).await.is_err() {
            tracing::debug!(connection_id = %self.connection, "Outbound channel closed");
        }
    }

    /// Detach from presence and the room, keep the socket open
    fn leave(&mut self) {
        if let ConnectionState::Attached(_) = self.state {
            self.collab.service.disconnect(&self.connection);
            self.state = ConnectionState::Detached;
        }
    }

    fn cleanup(&mut self) {
        self.leave();
        self.collab.hub.release(&self.connection);
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        // Ensure cleanup happens on drop
        self.cleanup();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::core::collab::{ClockSyncService, session_router};
    use crate::core::config::AllowedOrigins;

    fn new_session(state: &CollabState) -> (ConnectionSession, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionSession::new(tx, state.clone()), rx)
    }

    fn params(session_id: &str, user_id: &str) -> ConnectParams {
        ConnectParams {
            session_id: Some(session_id.into()),
            user_id: Some(user_id.into()),
            username: Some(user_id.to_uppercase()),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    fn create_session(state: &CollabState) -> Session {
        state
            .service
            .create_session(SessionPatch {
                name: Some("Demo".into()),
                created_by: Some("u1".into()),
                ..Default::default()
            })
            .unwrap()
    }

    async fn attached(
        state: &CollabState,
        session_id: &str,
        user_id: &str,
    ) -> (ConnectionSession, mpsc::Receiver<ServerMessage>) {
        let (mut session, rx) = new_session(state);
        session.attach(params(session_id, user_id)).await.unwrap();
        (session, rx)
    }

    fn update_frame(id: &str, updated_at: Millis, name: &str, ack: u64) -> String {
        serde_json::json!({
            "event": "updateSession",
            "ack": ack,
            "data": {"id": id, "updatedAt": updated_at, "name": name}
        })
        .to_string()
    }

    // ========================================================================
    // ConnectionSession Tests
    // ========================================================================

    #[test]
    fn test_connection_session_initial_state() {
        let state = CollabState::new();
        let (session, _rx) = new_session(&state);

        assert!(!session.is_attached());
        assert!(session.require_attached().is_err());
    }

    #[tokio::test]
    async fn test_attach_sends_snapshot_then_record() {
        let state = CollabState::new();
        let created = create_session(&state);
        let (session, mut rx) = attached(&state, &created.id, "u2").await;

        assert!(session.is_attached());
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ServerMessage::ActiveUsers { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].user_id, "u2");
                assert_eq!(users[0].username, "U2");
            }
            other => panic!("Expected ActiveUsers, got {:?}", other),
        }
        match &messages[1] {
            ServerMessage::SessionUpdated(record) => {
                assert_eq!(record.participants, vec!["u1".to_string(), "u2".to_string()]);
            }
            other => panic!("Expected SessionUpdated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_missing_identity() {
        let state = CollabState::new();
        let (mut session, mut rx) = new_session(&state);

        let result = session
            .attach(ConnectParams {
                session_id: Some("s1".into()),
                ..Default::default()
            })
            .await;

        assert_eq!(result, Err(SessionError::MissingIdentity));
        assert!(!session.is_attached());
        assert!(!state.hub.send_to(&session.connection, ServerMessage::Pong));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_get_server_time_ack() {
        let state = CollabState::new();
        let (mut session, mut rx) = new_session(&state);

        session
            .handle_text(r#"{"event":"getServerTime","ack":1}"#)
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::Ack {
                id,
                response: AckResponse::ServerTime(time),
            } => {
                assert_eq!(id, 1);
                assert!(time.server_time > 0);
            }
            other => panic!("Expected server time ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_message_reports_error() {
        let state = CollabState::new();
        let (mut session, mut rx) = new_session(&state);

        session.handle_text("not json").await;
        session.handle_text(r#"{"event":"noSuchEvent"}"#).await;

        for msg in drain(&mut rx) {
            assert!(matches!(
                msg,
                ServerMessage::Error {
                    code: WsErrorCode::InvalidMessage,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn test_update_requires_attachment() {
        let state = CollabState::new();
        let created = create_session(&state);
        let (mut session, mut rx) = new_session(&state);

        session
            .handle_text(&update_frame(&created.id, created.updated_at + 1, "x", 1))
            .await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Error {
                code: WsErrorCode::NotAttached,
                ..
            }
        ));
        assert_eq!(state.service.get_session(&created.id).unwrap().name, "Demo");
    }

    #[tokio::test]
    async fn test_update_acks_sender_and_broadcasts_to_others() {
        let state = CollabState::new();
        let created = create_session(&state);
        let (mut alice, mut alice_rx) = attached(&state, &created.id, "u1").await;
        let (_bob, mut bob_rx) = attached(&state, &created.id, "u2").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let stored = state.service.get_session(&created.id).unwrap();
        let frame = update_frame(&created.id, stored.updated_at + 5, "Renamed", 7);
        alice.handle_text(&frame).await;

        match alice_rx.try_recv().unwrap() {
            ServerMessage::Ack {
                id: 7,
                response: AckResponse::Update(ack),
            } => {
                assert!(ack.success);
                assert_eq!(ack.session.unwrap().name, "Renamed");
            }
            other => panic!("Expected update ack, got {:?}", other),
        }
        assert!(alice_rx.try_recv().is_err());

        match bob_rx.try_recv().unwrap() {
            ServerMessage::SessionUpdated(record) => assert_eq!(record.name, "Renamed"),
            other => panic!("Expected SessionUpdated, got {:?}", other),
        }

        // Replaying the same timestamp is stale
        alice.handle_text(&frame).await;
        match alice_rx.try_recv().unwrap() {
            ServerMessage::Ack {
                response: AckResponse::Update(ack),
                ..
            } => {
                assert!(!ack.success);
                assert_eq!(ack.reason.as_deref(), Some("stale"));
            }
            other => panic!("Expected rejected ack, got {:?}", other),
        }
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_auth_update_reports_error() {
        let state = CollabState::new();
        let created = create_session(&state);
        let (mut session, mut rx) = attached(&state, &created.id, "u1").await;
        drain(&mut rx);

        let frame = serde_json::json!({
            "event": "auth_update",
            "data": {
                "sessionId": created.id,
                "authData": {"tagUserParams": {"t": 1}, "updatedAt": 1}
            }
        });
        session.handle_text(&frame.to_string()).await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Error {
                code: WsErrorCode::Stale,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_leave_session_announces_departure() {
        let state = CollabState::new();
        let (mut alice, mut alice_rx) = attached(&state, "s1", "u1").await;
        let (_bob, mut bob_rx) = attached(&state, "s1", "u2").await;
        drain(&mut bob_rx);

        assert!(matches!(
            drain(&mut alice_rx).last(),
            Some(ServerMessage::UserJoined(user)) if user.user_id == "u2"
        ));

        alice.handle_text(r#"{"event":"leaveSession"}"#).await;
        assert!(!alice.is_attached());
        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerMessage::UserLeft(user) if user.user_id == "u1"
        ));

        // A second leave is a no-op
        alice.handle_text(r#"{"event":"leaveSession"}"#).await;
        assert!(bob_rx.try_recv().is_err());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_cleans_up() {
        let state = CollabState::new();
        let (alice, _alice_rx) = attached(&state, "s1", "u1").await;
        let (_bob, mut bob_rx) = attached(&state, "s1", "u2").await;
        drain(&mut bob_rx);
        let connection = alice.connection;

        drop(alice);

        assert!(matches!(bob_rx.try_recv().unwrap(), ServerMessage::UserLeft(_)));
        assert!(!state.hub.send_to(&connection, ServerMessage::Pong));
        assert_eq!(state.service.presence().list_online("s1").len(), 1);
    }

    #[tokio::test]
    async fn test_chat_message_relay() {
        let state = CollabState::new();
        let (mut alice, mut alice_rx) = attached(&state, "s1", "u1").await;
        let (_bob, mut bob_rx) = attached(&state, "s1", "u2").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        alice
            .handle_text(r#"{"event":"sendMessage","data":{"text":"hello"}}"#)
            .await;

        match bob_rx.try_recv().unwrap() {
            ServerMessage::ChatMessage(chat) => {
                assert_eq!(chat.text, "hello");
                assert_eq!(chat.username, "U1");
            }
            other => panic!("Expected ChatMessage, got {:?}", other),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let state = CollabState::new();
        let (mut session, mut rx) = new_session(&state);

        session.handle_text(r#"{"event":"ping"}"#).await;
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);
    }

    #[tokio::test]
    async fn test_unparseable_acked_update_is_rejected_with_ack() {
        let state = CollabState::new();
        let created = create_session(&state);
        let (mut session, mut rx) = attached(&state, &created.id, "u1").await;
        drain(&mut rx);

        let frame = serde_json::json!({
            "event": "updateSession",
            "ack": 3,
            "data": {"id": created.id, "name": "No timestamp"}
        });
        session.handle_text(&frame.to_string()).await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ServerMessage::Ack {
                id: 3,
                response: AckResponse::Update(ack),
            } => {
                assert!(!ack.success);
                assert_eq!(ack.reason.as_deref(), Some("validation"));
            }
            other => panic!("Expected rejected ack, got {:?}", other),
        }
        assert!(matches!(
            messages[1],
            ServerMessage::Error {
                code: WsErrorCode::InvalidMessage,
                ..
            }
        ));
        assert_eq!(state.service.get_session(&created.id).unwrap().name, "Demo");
    }

    #[test]
    fn test_missing_identity_closes_with_policy_frame() {
        match rejection_frame(&SessionError::MissingIdentity) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::POLICY);
                assert_eq!(frame.reason.as_str(), SessionError::MissingIdentity.to_string());
            }
            other => panic!("Expected close frame, got {:?}", other),
        }
    }

    // ========================================================================
    // Upgrade Endpoint Tests
    // ========================================================================

    fn restricted_app() -> axum::Router {
        let state = CollabState::with_clock(
            10,
            AllowedOrigins::parse("http://localhost:5173"),
            ClockSyncService::system(),
        );
        session_router(state)
    }

    fn upgrade_request(origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("GET")
            .uri("/ws?sessionId=s1&userId=u1&username=Ann")
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_disallowed_origin_is_forbidden() {
        let response = restricted_app()
            .oneshot(upgrade_request(Some("http://evil.example")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "forbidden");
    }

    #[tokio::test]
    async fn test_allowed_or_missing_origin_reaches_upgrade() {
        // Without a real connection to hijack the handshake stops at 426
        for origin in [Some("http://localhost:5173"), Some("http://localhost:5173/"), None] {
            let response = restricted_app()
                .oneshot(upgrade_request(origin))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED, "origin {:?}", origin);
        }
    }
}
