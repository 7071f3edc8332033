//! Hybrid logical clock.
//!
//! A [`Timestamp`] pairs wall-clock milliseconds with a per-device counter.
//! The clock never hands out the same value twice and never goes backwards,
//! even when the wall clock does: if the wall clock has not advanced past the
//! last issued value, the counter is bumped instead.
//!
//! Remote timestamps are folded in with [`HybridClock::observe`] so that any
//! edit made after seeing a remote record is ordered after it. Remote values
//! more than [`MAX_CLOCK_DRIFT_MS`] ahead of the local wall clock are refused
//! by [`HybridClock::admits`]; adopting one would pin every later local
//! timestamp to it.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// How far ahead of the local wall clock a remote timestamp may be.
pub const MAX_CLOCK_DRIFT_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("Clock exhausted after {0}")]
    Exhausted(Timestamp),
}

/// A hybrid logical timestamp `(wall_ms, counter)`, ordered lexicographically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Wall-clock milliseconds since the Unix epoch
    pub wall_ms: u64,
    /// Logical counter disambiguating events within the same millisecond
    pub counter: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_ms: 0,
        counter: 0,
    };

    pub const fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    /// The smallest timestamp strictly greater than `self`, if there is one.
    pub fn successor(self) -> Option<Self> {
        match self.counter.checked_add(1) {
            Some(counter) => Some(Self::new(self.wall_ms, counter)),
            None => self.wall_ms.checked_add(1).map(|wall_ms| Self::new(wall_ms, 0)),
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_ms, self.counter)
    }
}

/// Source of wall-clock time.
pub trait WallClock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> u64 {
        web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven wall clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Per-device hybrid logical clock.
///
/// Cloning shares the underlying state, so every component built from the
/// same [`crate::SyncContext`] stamps from one monotonic sequence.
#[derive(Clone)]
pub struct HybridClock {
    last: Arc<Mutex<Timestamp>>,
    wall: Arc<dyn WallClock>,
}

impl HybridClock {
    pub fn new(wall: Arc<dyn WallClock>) -> Self {
        Self {
            last: Arc::new(Mutex::new(Timestamp::ZERO)),
            wall,
        }
    }

    /// Clock driven by the system time.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Issue a fresh timestamp, strictly greater than every timestamp issued
    /// or observed so far.
    pub fn tick(&self) -> Result<Timestamp, ClockError> {
        let wall = self.wall.now_ms();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = if wall > last.wall_ms {
            Timestamp::new(wall, 0)
        } else {
            last.successor().ok_or(ClockError::Exhausted(*last))?
        };
        *last = next;
        Ok(next)
    }

    /// Whether a remote timestamp is close enough to the local wall clock
    /// to be trusted.
    pub fn admits(&self, seen: Timestamp) -> bool {
        seen.wall_ms <= self.wall.now_ms().saturating_add(MAX_CLOCK_DRIFT_MS)
    }

    /// Fold in a timestamp seen elsewhere (remote record, persisted state).
    /// Remote values should pass [`admits`](Self::admits) first.
    pub fn observe(&self, seen: Timestamp) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if seen > *last {
            *last = seen;
        }
    }

    /// The most recent timestamp issued or observed.
    pub fn last(&self) -> Timestamp {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raw wall-clock reading, used for retention windows.
    pub fn wall_now(&self) -> u64 {
        self.wall.now_ms()
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &self.last())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(now: u64) -> (Arc<ManualClock>, HybridClock) {
        let wall = Arc::new(ManualClock::new(now));
        let clock = HybridClock::new(wall.clone());
        (wall, clock)
    }

    #[test]
    fn test_tick_uses_wall_clock_when_it_advances() {
        let (wall, clock) = manual(1_000);
        assert_eq!(clock.tick().unwrap(), Timestamp::new(1_000, 0));
        wall.set(2_000);
        assert_eq!(clock.tick().unwrap(), Timestamp::new(2_000, 0));
    }

    #[test]
    fn test_tick_bumps_counter_within_same_millisecond() {
        let (_wall, clock) = manual(1_000);
        let a = clock.tick().unwrap();
        let b = clock.tick().unwrap();
        let c = clock.tick().unwrap();
        assert!(a < b && b < c);
        assert_eq!(c, Timestamp::new(1_000, 2));
    }

    #[test]
    fn test_tick_survives_wall_clock_going_backwards() {
        let (wall, clock) = manual(5_000);
        let before = clock.tick().unwrap();
        wall.set(1_000);
        let after = clock.tick().unwrap();
        assert!(after > before);
        assert_eq!(after.wall_ms, 5_000);
    }

    #[test]
    fn test_observe_orders_later_ticks_after_remote() {
        let (_wall, clock) = manual(1_000);
        clock.observe(Timestamp::new(9_000, 7));
        assert_eq!(clock.tick().unwrap(), Timestamp::new(9_000, 8));
    }

    #[test]
    fn test_observe_ignores_older_timestamps() {
        let (_wall, clock) = manual(1_000);
        let issued = clock.tick().unwrap();
        clock.observe(Timestamp::new(10, 0));
        assert_eq!(clock.last(), issued);
    }

    #[test]
    fn test_successor_rolls_counter_into_wall() {
        let ts = Timestamp::new(41, u32::MAX);
        assert_eq!(ts.successor(), Some(Timestamp::new(42, 0)));
        assert_eq!(Timestamp::new(u64::MAX, u32::MAX).successor(), None);
        assert_eq!(
            Timestamp::new(u64::MAX, 3).successor(),
            Some(Timestamp::new(u64::MAX, 4))
        );
    }

    #[test]
    fn test_tick_fails_instead_of_wrapping() {
        let (_wall, clock) = manual(1_000);
        let end = Timestamp::new(u64::MAX, u32::MAX);
        clock.observe(end);
        assert_eq!(clock.tick(), Err(ClockError::Exhausted(end)));
        assert_eq!(clock.last(), end);
    }

    #[test]
    fn test_admits_rejects_far_future_timestamps() {
        let (wall, clock) = manual(1_000);
        assert!(clock.admits(Timestamp::new(1_000 + MAX_CLOCK_DRIFT_MS, u32::MAX)));
        assert!(!clock.admits(Timestamp::new(1_001 + MAX_CLOCK_DRIFT_MS, 0)));
        assert!(!clock.admits(Timestamp::new(u64::MAX, u32::MAX)));
        wall.set(u64::MAX);
        assert!(clock.admits(Timestamp::new(u64::MAX, u32::MAX)));
    }

    #[test]
    fn test_clones_share_state() {
        let (_wall, clock) = manual(1_000);
        let other = clock.clone();
        let a = clock.tick().unwrap();
        let b = other.tick().unwrap();
        assert!(b > a);
    }
}
