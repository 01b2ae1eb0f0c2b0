//! Logical clock shared by the conductor, its devices and their queues
//!
//! All scheduling is expressed in milliseconds on this clock instead of the
//! wall clock, so several instances can share a synchronized time source and
//! tests can step time by hand.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Millisecond timestamp on the logical clock
pub type Time = i64;

/// Source of "now" for the resolve loop and the timed command queues
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current logical time in milliseconds
    fn now(&self) -> Time;

    /// Wait until the clock reaches `time` (returns immediately if it already has)
    async fn sleep_until(&self, time: Time);
}

/// Wall-clock time (Unix epoch milliseconds) plus a fixed offset
#[derive(Debug, Default, Clone)]
pub struct SystemClock {
    offset_ms: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { offset_ms: 0 }
    }

    /// Clock shifted by `offset_ms`, e.g. to follow an external time server
    pub fn with_offset(offset_ms: i64) -> Self {
        Self { offset_ms }
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Time {
        chrono::Utc::now().timestamp_millis() + self.offset_ms
    }

    async fn sleep_until(&self, time: Time) {
        // Re-check after waking: the system clock may have been adjusted.
        loop {
            let remaining = time - self.now();
            if remaining <= 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
        }
    }
}

/// Hand-driven clock for deterministic tests and offline replays
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
    changed: Notify,
}

impl ManualClock {
    pub fn new(start: Time) -> Self {
        Self {
            now: AtomicI64::new(start),
            changed: Notify::new(),
        }
    }

    /// Jump to an absolute time and wake every sleeper
    pub fn set(&self, time: Time) {
        self.now.store(time, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Move forward by `delta` milliseconds
    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep_until(&self, time: Time) {
        loop {
            // Register interest before checking, so an advance in between is not missed
            let notified = self.changed.notified();
            if self.now() >= time {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_clock_set_and_advance() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[tokio::test]
    async fn test_manual_clock_wakes_sleeper() {
        let clock = Arc::new(ManualClock::new(0));
        let sleeper = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move { clock.sleep_until(1000).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sleeper.is_finished());

        clock.set(1000);
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleeper should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_system_clock_past_deadline_returns() {
        let clock = SystemClock::new();
        let past = clock.now() - 1000;
        tokio::time::timeout(Duration::from_millis(100), clock.sleep_until(past))
            .await
            .unwrap();
    }

    #[test]
    fn test_system_clock_offset() {
        let base = SystemClock::new();
        let shifted = SystemClock::with_offset(60_000);
        let diff = shifted.now() - base.now();
        assert!((59_000..=61_000).contains(&diff));
    }
}
