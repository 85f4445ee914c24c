//! Logical clock sources.

use std::sync::atomic::{AtomicU64, Ordering};

/// A source of logical time.
///
/// Implementations must be monotonic within one planner lifetime. All planner timeouts, such as
/// failure backoff and lease durations, are expressed in ticks of this clock.
pub trait CurrentTimeProvider: Send + Sync {
    /// Return the current logical time.
    fn current_time(&self) -> u64;
}

/// A clock ticking in milliseconds since the Unix epoch.
///
/// Wall time may step backwards, so every reading is clamped to the highest value returned so far.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CurrentTimeProvider for SystemClock {
    fn current_time(&self) -> u64 {
        let millis = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let now = u64::try_from(millis).unwrap_or(0);
        let prev = self.last.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }
}

/// A clock which only moves when explicitly advanced.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    /// Advance the clock by the given number of ticks, returning the new time.
    pub fn advance(&self, ticks: u64) -> u64 {
        self.now.fetch_add(ticks, Ordering::SeqCst) + ticks
    }
}

#[cfg(test)]
impl CurrentTimeProvider for ManualClock {
    fn current_time(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
