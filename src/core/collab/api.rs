//! REST API handlers for session management
//!
//! This module provides the HTTP API endpoints:
//! - POST   /sessions               - Create a session
//! - GET    /sessions               - List sessions, most recently updated first
//! - GET    /sessions/{id}          - Get one session
//! - PATCH  /sessions/{id}          - Upsert (create if absent, otherwise merge)
//! - DELETE /sessions/{id}          - Delete a session
//! - GET    /sessions/{id}/exists   - Existence check
//! - POST   /sessions/{id}/join     - Add a participant
//! - GET    /ws                     - Push channel upgrade
//!
//! Error bodies are `ApiError` JSON; see `SessionError` for the status mapping.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use super::broadcast::RoomHub;
use super::clock::ClockSyncService;
use super::presence::PresenceRegistry;
use super::protocol::*;
use super::service::SessionService;
use super::store::{DEFAULT_MAX_SESSIONS, SessionStore};
use super::websocket::ws_handler;
use crate::core::config::{AllowedOrigins, Config};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the session service
#[derive(Clone)]
pub struct CollabState {
    pub service: Arc<SessionService>,
    /// Room hub the service publishes through; the push channel registers outboxes here
    pub hub: Arc<RoomHub>,
    pub origins: AllowedOrigins,
}

impl CollabState {
    /// Create state with default capacity, any origin and the system clock
    pub fn new() -> Self {
        Self::with_clock(DEFAULT_MAX_SESSIONS, AllowedOrigins::Any, ClockSyncService::system())
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_clock(
            config.max_sessions,
            config.allowed_origins.clone(),
            ClockSyncService::system(),
        )
    }

    pub fn with_clock(max_sessions: usize, origins: AllowedOrigins, clock: ClockSyncService) -> Self {
        let store = Arc::new(SessionStore::new(max_sessions, clock));
        let hub = Arc::new(RoomHub::new());
        let service = SessionService::new(store, Arc::new(PresenceRegistry::new()), hub.clone());

        Self {
            service: Arc::new(service),
            hub,
            origins,
        }
    }
}

impl Default for CollabState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the session router, push channel included
pub fn session_router(state: CollabState) -> Router {
    let cors = state.origins.cors_layer();

    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            get(get_session).patch(upsert_session).delete(delete_session),
        )
        .route("/sessions/{id}/exists", get(session_exists))
        .route("/sessions/{id}/join", post(join_session))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /sessions
///
/// Request body: `{name, createdBy, creatorName?, ...params}`
/// Response: Session (201 Created) or ApiError
async fn create_session(
    State(state): State<CollabState>,
    Json(body): Json<SessionPatch>,
) -> impl IntoResponse {
    match state.service.create_session(body) {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /sessions
async fn list_sessions(State(state): State<CollabState>) -> impl IntoResponse {
    Json(state.service.list_sessions())
}

/// GET /sessions/{id}
async fn get_session(
    State(state): State<CollabState>,
    Path(id): Path<SessionId>,
) -> impl IntoResponse {
    match state.service.get_session(&id) {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /sessions/{id}/exists
async fn session_exists(
    State(state): State<CollabState>,
    Path(id): Path<SessionId>,
) -> impl IntoResponse {
    Json(ExistsResponse {
        exists: state.service.session_exists(&id),
    })
}

/// POST /sessions/{id}/join
///
/// Request body: `{userId, username?}`
async fn join_session(
    State(state): State<CollabState>,
    Path(id): Path<SessionId>,
    Json(request): Json<JoinRequest>,
) -> impl IntoResponse {
    match state.service.join_session(&id, request) {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PATCH /sessions/{id}
///
/// Creates the session when absent (subject to capacity), otherwise merges
/// the body into it. No timestamp check is applied on this path.
async fn upsert_session(
    State(state): State<CollabState>,
    Path(id): Path<SessionId>,
    Json(patch): Json<SessionPatch>,
) -> impl IntoResponse {
    match state.service.upsert_session(&id, patch) {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /sessions/{id}
///
/// Response: 204 No Content or ApiError
async fn delete_session(
    State(state): State<CollabState>,
    Path(id): Path<SessionId>,
) -> impl IntoResponse {
    match state.service.delete_session(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================
