//! Room-based fan-out of server events
//!
//! A room is the set of connections subscribed to one session's traffic.
//! Room membership is independent of presence: a connection can subscribe
//! without an identity, although the push channel establishes both together.
//!
//! Delivery is fire-and-forget. Each connection owns a bounded outbound queue;
//! publishing never waits on it, so a slow or vanished recipient only loses
//! its own copy of the event.

use std::collections::BTreeSet;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::protocol::*;

/// Who receives a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every subscriber of the room
    Everyone,
    /// Every subscriber except the connection that triggered the event
    ExceptSender(ConnectionId),
}

impl Audience {
    fn includes(&self, connection: &ConnectionId) -> bool {
        match self {
            Self::Everyone => true,
            Self::ExceptSender(sender) => sender != connection,
        }
    }
}

/// Room capability the session service publishes through
pub trait BroadcastRouter: Send + Sync {
    fn subscribe(&self, connection: ConnectionId, session_id: &str);

    fn unsubscribe(&self, connection: ConnectionId, session_id: &str);

    /// Deliver `message` to the room; returns how many connections accepted it
    fn publish(&self, session_id: &str, message: ServerMessage, audience: Audience) -> usize;
}

/// In-process rooms backed by per-connection `mpsc` queues
#[derive(Default)]
pub struct RoomHub {
    rooms: DashMap<SessionId, BTreeSet<ConnectionId>>,
    outboxes: DashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connection` reachable through `outbox`
    pub fn register(&self, connection: ConnectionId, outbox: mpsc::Sender<ServerMessage>) {
        self.outboxes.insert(connection, outbox);
    }

    /// Forget `connection` entirely: its outbox and every room membership
    pub fn release(&self, connection: &ConnectionId) {
        self.outboxes.remove(connection);
        self.rooms.retain(|_, members| {
            members.remove(connection);
            !members.is_empty()
        });
    }

    /// Subscribers of a room, in delivery order
    pub fn members(&self, session_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(session_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Deliver directly to one connection
    pub fn send_to(&self, connection: &ConnectionId, message: ServerMessage) -> bool {
        match self.outboxes.get(connection) {
            Some(outbox) => deliver(connection, &outbox, message),
            None => false,
        }
    }
}

impl BroadcastRouter for RoomHub {
    fn subscribe(&self, connection: ConnectionId, session_id: &str) {
        self.rooms
            .entry(session_id.to_string())
            .or_default()
            .insert(connection);
    }

    fn unsubscribe(&self, connection: ConnectionId, session_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(session_id) {
            members.remove(&connection);
        }
        self.rooms.remove_if(session_id, |_, members| members.is_empty());
    }

    fn publish(&self, session_id: &str, message: ServerMessage, audience: Audience) -> usize {
        let members = self.members(session_id);
        let mut delivered = 0;

        for connection in members.iter().filter(|c| audience.includes(c)) {
            let Some(outbox) = self.outboxes.get(connection) else {
                continue;
            };
            if deliver(connection, &outbox, message.clone()) {
                delivered += 1;
            }
        }

        tracing::trace!(
            session_id = %session_id,
            event = message.event_name(),
            delivered,
            "Published to room"
        );
        delivered
    }
}

fn deliver(
    connection: &ConnectionId,
    outbox: &mpsc::Sender<ServerMessage>,
    message: ServerMessage,
) -> bool {
    match outbox.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            tracing::warn!(
                connection_id = %connection,
                event = message.event_name(),
                "Outbound queue full, dropping event"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(connection_id = %connection, "Outbound queue closed");
            false
        }
    }
}
