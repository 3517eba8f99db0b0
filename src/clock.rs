//! Time sources for bucket refill and circuit recovery.
//!
//! All timestamps are durations since the UNIX epoch so that the same value
//! can be handed to a distributed store and compared across processes.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Current time as a duration since the UNIX epoch.
    fn now(&self) -> Duration;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time. Moving backwards is allowed.
    pub fn set(&self, to: Duration) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(1_700_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// The default clock shared by registries.
pub fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Render an epoch offset as a UTC date-time.
pub fn to_datetime(at: Duration) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(at.as_secs() as i64, at.subsec_nanos())
}
