//! Jitter for retry delays, to keep clients from retrying in lockstep.
//!
//! - `Full`: uniform in `[0, delay]`, a good default to spread load.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor while adding randomness.
//! - `Decorrelated`: uniform in `[0, 3 × delay]`, trades a longer tail for less overlap.
//!
//! An optional `max` caps the jittered result.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via `apply_with_rng`.
//! - Precision: millisecond conversions saturate to `u64::MAX` to avoid panics on very large durations.
//!
//! Example:
//! ```rust
//! use std::time::Duration;
//! use tollgate::Jitter;
//!
//! let jitter = Jitter::equal();
//! let delay = jitter.apply(Duration::from_millis(100));
//! assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Shape of the random spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum JitterKind {
    Full,
    Equal,
    Decorrelated,
}

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Jitter {
    pub kind: JitterKind,
    /// Upper bound on the jittered delay
    #[cfg_attr(feature = "serde", serde(default))]
    pub max: Option<Duration>,
}

impl Jitter {
    pub fn new(kind: JitterKind) -> Self {
        Self { kind, max: None }
    }

    /// Create a full jitter strategy
    pub fn full() -> Self {
        Self::new(JitterKind::Full)
    }

    /// Create an equal jitter strategy
    pub fn equal() -> Self {
        Self::new(JitterKind::Equal)
    }

    /// Create a decorrelated jitter strategy
    pub fn decorrelated() -> Self {
        Self::new(JitterKind::Decorrelated)
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = as_millis_saturated(delay);
        let jittered = if millis == 0 {
            0
        } else {
            match self.kind {
                JitterKind::Full => rng.random_range(0..=millis),
                JitterKind::Equal => {
                    let half = millis / 2 + millis % 2;
                    rng.random_range(half..=millis)
                }
                JitterKind::Decorrelated => rng.random_range(0..=millis.saturating_mul(3)),
            }
        };
        let jittered = Duration::from_millis(jittered);
        match self.max {
            Some(max) => jittered.min(max),
            None => jittered,
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX) // Saturate extremely large durations
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn full_jitter_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(400);
        for _ in 0..1_000 {
            let d = Jitter::full().apply_with_rng(base, &mut rng);
            assert!(d <= base);
        }
    }

    #[test]
    fn equal_jitter_keeps_half_floor() {
        let mut rng = StdRng::seed_from_u64(11);
        let base = Duration::from_millis(401);
        for _ in 0..1_000 {
            let d = Jitter::equal().apply_with_rng(base, &mut rng);
            assert!(d.as_secs_f64() >= base.as_secs_f64() * 0.5, "{:?}", d);
            assert!(d <= base);
        }
    }

    #[test]
    fn decorrelated_spreads_to_three_times() {
        let mut rng = StdRng::seed_from_u64(3);
        let base = Duration::from_millis(100);
        let samples: Vec<Duration> =
            (0..2_000).map(|_| Jitter::decorrelated().apply_with_rng(base, &mut rng)).collect();
        assert!(samples.iter().all(|d| *d <= Duration::from_millis(300)));
        assert!(samples.iter().any(|d| *d > base), "some samples exceed the base delay");
    }

    #[test]
    fn max_caps_result() {
        let mut rng = StdRng::seed_from_u64(5);
        let jitter = Jitter::decorrelated().with_max(Duration::from_millis(120));
        for _ in 0..500 {
            assert!(jitter.apply_with_rng(Duration::from_millis(100), &mut rng) <= Duration::from_millis(120));
        }
    }

    #[test]
    fn zero_delay_stays_zero() {
        for jitter in [Jitter::full(), Jitter::equal(), Jitter::decorrelated()] {
            assert_eq!(jitter.apply(Duration::ZERO), Duration::ZERO);
        }
    }

    #[test]
    fn huge_delay_does_not_panic() {
        let d = Jitter::full().apply(Duration::from_secs(u64::MAX));
        assert!(d <= Duration::from_millis(u64::MAX));
    }
}
