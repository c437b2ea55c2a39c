//! Real-time session synchronization
//!
//! Provides a bounded in-memory session store shared by many clients with:
//! - Last-writer-wins conflict resolution on client timestamps
//! - Per-session rooms and presence tracking
//! - A REST API plus a WebSocket push channel

mod api;
mod broadcast;
mod clock;
mod conflict;
mod error;
mod presence;
mod protocol;
mod service;
mod store;
mod websocket;

pub use api::*;
pub use broadcast::*;
pub use clock::*;
pub use conflict::*;
pub use error::*;
pub use presence::*;
pub use protocol::*;
pub use service::*;
pub use store::*;
pub use websocket::*;
