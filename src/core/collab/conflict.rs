//! Last-writer-wins decision rule for conflict-checked writes
//!
//! A write is accepted only if its timestamp is strictly newer than the stored
//! `updatedAt`. Equal timestamps are rejected so accepted writes to one session
//! form a strict total order. The rule works at whole-patch granularity: the
//! accepted patch wins in full.

use super::error::SessionError;
use super::protocol::Millis;

/// Outcome of comparing an incoming write against stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accept,
    Stale,
}

/// Decide whether `incoming` supersedes `stored`
pub fn resolve(stored: Millis, incoming: Millis) -> Resolution {
    if incoming > stored {
        Resolution::Accept
    } else {
        Resolution::Stale
    }
}

/// [`resolve`] as a `Result`, carrying both timestamps on rejection
pub fn ensure_newer(stored: Millis, incoming: Millis) -> Result<(), SessionError> {
    match resolve(stored, incoming) {
        Resolution::Accept => Ok(()),
        Resolution::Stale => Err(SessionError::Stale { stored, incoming }),
    }
}
