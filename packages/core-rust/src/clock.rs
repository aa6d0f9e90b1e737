//! Wall-clock abstraction for cache timestamps.
//!
//! Every `since` / `checked` timestamp in the inventory is milliseconds
//! since the Unix epoch, taken through [`ClockSource`] so tests can swap in
//! a virtual clock and drive grace periods and duty cycles deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

/// Milliseconds in one UTC day.
pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a virtual
/// one. The default implementation ([`SystemClock`]) delegates to
/// `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch");
        i64::try_from(elapsed.as_millis()).expect("system clock beyond i64 millis range")
    }
}

/// Settable clock for tests.
///
/// Starts at the given epoch-ms value and only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a manual clock pinned at `now_ms`.
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    /// Moves the clock to an absolute epoch-ms value.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Advances the clock by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Renders an epoch-ms timestamp as an ISO-8601 UTC string.
///
/// Returns an empty string for non-positive inputs, which the inventory
/// uses for "never" (`checked = 0`).
#[must_use]
pub fn iso8601_utc(epoch_ms: i64) -> String {
    if epoch_ms <= 0 {
        return String::new();
    }
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Returns the start of the UTC day containing `epoch_ms`.
#[must_use]
pub fn utc_midnight(epoch_ms: i64) -> i64 {
    epoch_ms - epoch_ms.rem_euclid(MILLIS_PER_DAY)
}
