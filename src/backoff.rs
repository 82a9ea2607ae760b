//! Delay schedules for retry policies.
//!
//! Attempt semantics: `attempt_index` is the number of retries already made, so the
//! delay before the first retry is `delay(0)`. Five strategies are available:
//!
//! | strategy    | base delay for `attempt_index = i`             |
//! |-------------|-------------------------------------------------|
//! | exponential | `initial × multiplier^i` (multiplier 2)         |
//! | linear      | `initial + multiplier ms × i` (multiplier 1000) |
//! | fixed       | `initial`                                       |
//! | fibonacci   | `initial × fib(i + 1)`, `fib(0) = fib(1) = 1`   |
//! | custom      | a [`BackoffStrategy`] hook, else `initial × (i + 1)` |
//!
//! The base delay is then capped at `max`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use tollgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(800));
//! assert_eq!(backoff.delay(4), Duration::from_secs(1)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_MAX: Duration = Duration::from_secs(30);

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
    Custom,
}

/// User-supplied delay schedule for [`RetryStrategy::Custom`].
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt_index: u32) -> Duration;
}

/// A retry delay schedule: strategy, initial delay, cap and multiplier.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Backoff {
    strategy: RetryStrategy,
    initial: Duration,
    max: Duration,
    multiplier: Option<f64>,
    #[cfg_attr(feature = "serde", serde(skip))]
    hook: Option<Arc<dyn BackoffStrategy>>,
}

impl Backoff {
    /// `strategy` starting at `initial`, capped at 30 seconds.
    pub fn new(strategy: RetryStrategy, initial: Duration) -> Self {
        Self { strategy, initial, max: DEFAULT_MAX.max(initial), multiplier: None, hook: None }
    }

    pub fn exponential(initial: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, initial)
    }

    pub fn linear(initial: Duration) -> Self {
        Self::new(RetryStrategy::Linear, initial)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(RetryStrategy::Fixed, delay)
    }

    pub fn fibonacci(initial: Duration) -> Self {
        Self::new(RetryStrategy::Fibonacci, initial)
    }

    /// Custom strategy driven by `hook`.
    pub fn custom(initial: Duration, hook: impl BackoffStrategy + 'static) -> Self {
        Self::new(RetryStrategy::Custom, initial).with_hook(hook)
    }

    /// Replace the starting delay; the cap is left as is.
    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Cap every computed delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Growth factor for exponential, increment in milliseconds for linear. Ignored by
    /// the other strategies.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Delay hook consulted by [`RetryStrategy::Custom`].
    pub fn with_hook(mut self, hook: impl BackoffStrategy + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> Option<f64> {
        self.multiplier
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max.is_zero() {
            return Err(ConfigError::retry("max delay must be greater than zero"));
        }
        if self.max < self.initial {
            return Err(ConfigError::retry(format!(
                "max delay ({:?}) must be >= initial delay ({:?})",
                self.max, self.initial
            )));
        }
        if let Some(m) = self.multiplier {
            if !m.is_finite() || m < 0.0 {
                return Err(ConfigError::retry(format!("multiplier must be finite and >= 0 (got {})", m)));
            }
        }
        Ok(())
    }

    /// Uncapped delay before retry number `attempt_index + 1`.
    pub fn base_delay(&self, attempt_index: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Exponential => {
                let m = self.multiplier.unwrap_or(2.0);
                scale(self.initial, m.powi(attempt_index.min(i32::MAX as u32) as i32))
            }
            RetryStrategy::Linear => {
                let step_ms = self.multiplier.unwrap_or(1000.0) * f64::from(attempt_index);
                self.initial.saturating_add(scale(Duration::from_millis(1), step_ms))
            }
            RetryStrategy::Fixed => self.initial,
            RetryStrategy::Fibonacci => {
                let factor = fibonacci(attempt_index.saturating_add(1));
                self.initial.checked_mul(factor).unwrap_or(MAX_BACKOFF)
            }
            RetryStrategy::Custom => match &self.hook {
                Some(hook) => hook.delay(attempt_index),
                None => self.initial.checked_mul(attempt_index.saturating_add(1)).unwrap_or(MAX_BACKOFF),
            },
        }
    }

    /// Delay before retry number `attempt_index + 1`, capped at `max`.
    pub fn delay(&self, attempt_index: u32) -> Duration {
        self.base_delay(attempt_index).min(self.max).min(MAX_BACKOFF)
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt_index: u32) -> Duration {
        Backoff::delay(self, attempt_index)
    }
}

fn scale(base: Duration, factor: f64) -> Duration {
    let nanos = base.as_nanos() as f64 * factor;
    if !nanos.is_finite() || nanos >= MAX_BACKOFF.as_nanos() as f64 {
        MAX_BACKOFF
    } else if nanos <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// `fib(0) = fib(1) = 1`, saturating at `u32::MAX`.
fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
        if b == u32::MAX {
            break;
        }
    }
    b
}
