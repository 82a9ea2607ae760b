//! Abstraction for sleeping/waiting
//!
//! Enables fast, deterministic tests without real time delays

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that tracks all sleep calls
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        Box::pin(async {})
    }
}

/// Sleeper that advances a [`ManualClock`] instead of waiting.
///
/// Pairs with a component driven by the same `ManualClock` so elapsed-time bookkeeping
/// (total durations, circuit reset timeouts, dead-letter due dates) stays consistent
/// without any real delay.
#[derive(Debug, Clone)]
pub struct ClockSleeper {
    clock: ManualClock,
}

impl ClockSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock }
    }
}

impl Sleeper for ClockSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.clock.advance(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[tokio::test]
    async fn instant_sleeper_doesnt_sleep() {
        let sleeper = InstantSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_calls() {
        let sleeper = TrackingSleeper::new();

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);

        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn clock_sleeper_advances_manual_clock() {
        let clock = ManualClock::new(0);
        let sleeper = ClockSleeper::new(clock.clone());
        sleeper.sleep(Duration::from_millis(40)).await;
        sleeper.sleep(Duration::from_millis(2)).await;
        assert_eq!(clock.now_millis(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_follows_tokio_time() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
