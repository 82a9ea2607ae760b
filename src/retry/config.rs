//! Retry policies: the stored [`RetryConfig`], the [`RetryConfigSpec`] builder and the
//! [`RetryConfigUpdate`] patch.

use std::time::Duration;

use rand::Rng;

use super::RetryConditions;
use crate::backoff::{Backoff, BackoffStrategy, RetryStrategy};
use crate::circuit_breaker::CircuitBreakerSettings;
use crate::dead_letter::DeadLetterSettings;
use crate::error::ConfigError;
use crate::jitter::Jitter;

/// A registered retry policy.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
    pub(crate) id: String,
    pub(crate) backoff: Backoff,
    pub(crate) max_retries: u32,
    pub(crate) jitter: Option<Jitter>,
    pub(crate) conditions: RetryConditions,
    pub(crate) circuit_breaker: Option<CircuitBreakerSettings>,
    pub(crate) dead_letter: Option<DeadLetterSettings>,
    pub(crate) enabled: bool,
    pub(crate) created_at: u64,
    pub(crate) updated_at: u64,
}

impl RetryConfig {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.backoff.strategy()
    }

    /// Retries after the first attempt; an operation runs at most `max_retries + 1` times.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn jitter(&self) -> Option<&Jitter> {
        self.jitter.as_ref()
    }

    pub fn conditions(&self) -> &RetryConditions {
        &self.conditions
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerSettings> {
        self.circuit_breaker.as_ref()
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterSettings> {
        self.dead_letter.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    /// Delay before retry `attempt_index + 1`: the capped backoff, then jitter.
    pub fn calculate_delay(&self, attempt_index: u32) -> Duration {
        self.calculate_delay_with_rng(attempt_index, &mut rand::rng())
    }

    /// [`calculate_delay`](Self::calculate_delay) with a caller-supplied RNG.
    pub fn calculate_delay_with_rng<R: Rng>(&self, attempt_index: u32, rng: &mut R) -> Duration {
        let delay = self.backoff.delay(attempt_index);
        match &self.jitter {
            Some(jitter) => jitter.apply_with_rng(delay, rng),
            None => delay,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(dead_letter) = &self.dead_letter {
            dead_letter.validate()?;
        }
        if self.conditions.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::retry("timeout must be > 0 when set"));
        }
        Ok(())
    }
}

/// Everything needed to register a retry config; id and timestamps are assigned on insert.
///
/// ```rust
/// use std::time::Duration;
/// use tollgate::retry::{RetryConditions, RetryConfigSpec};
/// use tollgate::{CircuitBreakerSettings, Jitter, RetryStrategy};
///
/// let spec = RetryConfigSpec::new(RetryStrategy::Exponential)
///     .id("webhooks")
///     .max_retries(4)
///     .initial_delay(Duration::from_millis(200))
///     .max_delay(Duration::from_secs(5))
///     .jitter(Jitter::full())
///     .conditions(RetryConditions::new().http_codes([429, 502, 503, 504]))
///     .circuit_breaker(
///         CircuitBreakerSettings::new(5, Duration::from_secs(30), Duration::from_secs(60)).unwrap(),
///     );
/// # let _ = spec;
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfigSpec {
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: Option<String>,
    pub backoff: Backoff,
    pub max_retries: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub jitter: Option<Jitter>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub conditions: RetryConditions,
    #[cfg_attr(feature = "serde", serde(default))]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub dead_letter: Option<DeadLetterSettings>,
    #[cfg_attr(feature = "serde", serde(default = "enabled_by_default"))]
    pub enabled: bool,
}

impl RetryConfigSpec {
    /// Three retries starting at one second, no jitter, no breaker, no dead-letter queue.
    pub fn new(strategy: RetryStrategy) -> Self {
        Self::with_backoff(Backoff::new(strategy, Duration::from_secs(1)))
    }

    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            id: None,
            backoff,
            max_retries: 3,
            jitter: None,
            conditions: RetryConditions::default(),
            circuit_breaker: None,
            dead_letter: None,
            enabled: true,
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, initial: Duration) -> Self {
        self.backoff = self.backoff.with_initial(initial);
        self
    }

    pub fn max_delay(mut self, max: Duration) -> Self {
        self.backoff = self.backoff.with_max(max);
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.backoff = self.backoff.with_multiplier(multiplier);
        self
    }

    /// Delay hook for [`RetryStrategy::Custom`].
    pub fn backoff_hook(mut self, hook: impl BackoffStrategy + 'static) -> Self {
        self.backoff = self.backoff.with_hook(hook);
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn conditions(mut self, conditions: RetryConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn circuit_breaker(mut self, settings: CircuitBreakerSettings) -> Self {
        self.circuit_breaker = Some(settings);
        self
    }

    pub fn dead_letter(mut self, settings: DeadLetterSettings) -> Self {
        self.dead_letter = Some(settings);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn into_config(self, id: String, now: u64) -> Result<RetryConfig, ConfigError> {
        let config = RetryConfig {
            id,
            backoff: self.backoff,
            max_retries: self.max_retries,
            jitter: self.jitter,
            conditions: self.conditions,
            circuit_breaker: self.circuit_breaker,
            dead_letter: self.dead_letter,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Partial update; `None` fields are left as they are. For the optional features,
/// `Some(None)` switches the feature off.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigUpdate {
    pub backoff: Option<Backoff>,
    pub max_retries: Option<u32>,
    pub jitter: Option<Option<Jitter>>,
    pub conditions: Option<RetryConditions>,
    pub circuit_breaker: Option<Option<CircuitBreakerSettings>>,
    pub dead_letter: Option<Option<DeadLetterSettings>>,
    pub enabled: Option<bool>,
}

impl RetryConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn jitter(mut self, jitter: Option<Jitter>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn conditions(mut self, conditions: RetryConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn circuit_breaker(mut self, settings: Option<CircuitBreakerSettings>) -> Self {
        self.circuit_breaker = Some(settings);
        self
    }

    pub fn dead_letter(mut self, settings: Option<DeadLetterSettings>) -> Self {
        self.dead_letter = Some(settings);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub(crate) fn apply(self, current: &RetryConfig, now: u64) -> Result<RetryConfig, ConfigError> {
        let mut next = current.clone();
        if let Some(backoff) = self.backoff {
            next.backoff = backoff;
        }
        if let Some(max_retries) = self.max_retries {
            next.max_retries = max_retries;
        }
        if let Some(jitter) = self.jitter {
            next.jitter = jitter;
        }
        if let Some(conditions) = self.conditions {
            next.conditions = conditions;
        }
        if let Some(breaker) = self.circuit_breaker {
            next.circuit_breaker = breaker;
        }
        if let Some(dead_letter) = self.dead_letter {
            next.dead_letter = dead_letter;
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        next.updated_at = now;
        next.validate()?;
        Ok(next)
    }
}

#[cfg(feature = "serde")]
fn enabled_by_default() -> bool {
    true
}
