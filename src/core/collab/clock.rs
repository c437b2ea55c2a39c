//! Server clock used for timestamps and client clock calibration

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use super::protocol::Millis;

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Millis;
}

/// Wall clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, value: Millis) {
        self.now.store(value, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Millis) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Answers "what time is it on the server"
///
/// Readings never go backwards, even if the underlying wall clock is stepped
/// back by NTP or an operator.
#[derive(Clone)]
pub struct ClockSyncService {
    clock: Arc<dyn Clock>,
    last: Arc<AtomicI64>,
}

impl ClockSyncService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Arc::new(AtomicI64::new(Millis::MIN)),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Current server time, monotonically non-decreasing across calls
    pub fn now(&self) -> Millis {
        let reading = self.clock.now_millis();
        let previous = self.last.fetch_max(reading, Ordering::SeqCst);
        previous.max(reading)
    }
}

impl Default for ClockSyncService {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for ClockSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSyncService")
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish()
    }
}
