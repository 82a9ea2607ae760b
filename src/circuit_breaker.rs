//! Per-config circuit breaker state machine.
//!
//! `Closed → Open` once `failure_threshold` failures land inside one monitoring window;
//! `Open → HalfOpen` once `reset_timeout` has passed; `HalfOpen → Closed` on the next
//! success, `HalfOpen → Open` on the next failure.
//!
//! The state is plain data owned by [`RetryHandler`](crate::RetryHandler), which
//! serializes access to it and turns the returned [`Transition`]s into log records and
//! events.

use std::time::Duration;

use crate::error::ConfigError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Probe mode: the next outcome decides between `Closed` and `Open`.
    HalfOpen,
}

/// Validated breaker settings of a retry config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CircuitBreakerSettings {
    failure_threshold: u32,
    reset_timeout: Duration,
    monitoring_window: Duration,
}

impl CircuitBreakerSettings {
    /// Create settings with validation: all three values must be non-zero.
    pub fn new(
        failure_threshold: u32,
        reset_timeout: Duration,
        monitoring_window: Duration,
    ) -> Result<Self, ConfigError> {
        let settings = Self { failure_threshold, reset_timeout, monitoring_window };
        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let reason = if self.failure_threshold == 0 {
            format!("failure_threshold must be > 0 (got {})", self.failure_threshold)
        } else if self.reset_timeout.is_zero() {
            format!("reset_timeout must be > 0 (got {:?})", self.reset_timeout)
        } else if self.monitoring_window.is_zero() {
            format!("monitoring_window must be > 0 (got {:?})", self.monitoring_window)
        } else {
            return Ok(());
        };
        Err(ConfigError::InvalidCircuitBreaker { reason })
    }

    /// Failures within one window that open the breaker.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Time spent open before a probe is admitted.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Length of the window over which counters accumulate.
    pub fn monitoring_window(&self) -> Duration {
        self.monitoring_window
    }
}

/// State change produced by a breaker operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Opened { failure_count: u32, reset_at: u64 },
    HalfOpened,
    Closed,
}

/// Breaker bookkeeping. Times are clock milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub request_count: u32,
    pub window_start: u64,
    pub last_failure_time: Option<u64>,
    pub last_success_time: Option<u64>,
    /// Set only while open
    pub reset_time: Option<u64>,
}

impl CircuitBreakerState {
    pub fn new(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            request_count: 0,
            window_start: now,
            last_failure_time: None,
            last_success_time: None,
            reset_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Time left until an open breaker admits a probe.
    pub fn retry_in(&self, now: u64) -> Duration {
        Duration::from_millis(self.reset_time.map_or(0, |at| at.saturating_sub(now)))
    }

    /// Roll the monitoring window and move `Open → HalfOpen` once the reset time passes.
    /// Called before every execution.
    pub(crate) fn check(&mut self, settings: &CircuitBreakerSettings, now: u64) -> Option<Transition> {
        if now.saturating_sub(self.window_start) >= millis(settings.monitoring_window) {
            self.failure_count = 0;
            self.success_count = 0;
            self.request_count = 0;
            self.window_start = now;
        }
        if self.state == CircuitState::Open && self.reset_time.map_or(true, |at| now >= at) {
            self.state = CircuitState::HalfOpen;
            self.failure_count = 0;
            self.reset_time = None;
            return Some(Transition::HalfOpened);
        }
        None
    }

    pub(crate) fn record_success(&mut self, now: u64) -> Option<Transition> {
        self.success_count = self.success_count.saturating_add(1);
        self.request_count = self.request_count.saturating_add(1);
        self.last_success_time = Some(now);
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.failure_count = 0;
            return Some(Transition::Closed);
        }
        None
    }

    pub(crate) fn record_failure(
        &mut self,
        settings: &CircuitBreakerSettings,
        now: u64,
    ) -> Option<Transition> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.request_count = self.request_count.saturating_add(1);
        self.last_failure_time = Some(now);
        let trip = match self.state {
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_count >= settings.failure_threshold,
        };
        if !trip {
            return None;
        }
        let reset_at = now.saturating_add(millis(settings.reset_timeout));
        self.state = CircuitState::Open;
        self.reset_time = Some(reset_at);
        Some(Transition::Opened { failure_count: self.failure_count, reset_at })
    }

    /// Force `Closed` with zeroed counters.
    pub(crate) fn reset(&mut self, now: u64) {
        *self = Self::new(now);
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
