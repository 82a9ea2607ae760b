use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::dead_letter::DeadLetterItem;
use crate::rate_limit::{RateLimitConfig, RateLimitContext};
use crate::retry::{FailureRecord, RetryConfig};

/// Events emitted by [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Clone)]
pub enum RateLimitEvent {
    /// A config was registered.
    ConfigAdded { config: Arc<RateLimitConfig> },
    /// A config was changed in place.
    ConfigUpdated { config: Arc<RateLimitConfig> },
    /// A config and all of its per-key state were removed.
    ConfigRemoved { config_id: String },
    /// Remaining quota fell to or below the config's notification threshold.
    ///
    /// Emitted on every qualifying check, not only on the first crossing.
    ThresholdExceeded {
        config: Arc<RateLimitConfig>,
        context: RateLimitContext,
        /// Quota left after this check
        remaining: u64,
        /// The config's request limit
        total: u64,
    },
    /// A check was denied.
    LimitExceeded {
        config_id: String,
        key: String,
        remaining: u64,
        retry_after: Option<Duration>,
    },
    /// The state sweep finished.
    CleanupCompleted { removed: usize },
}

/// Events emitted by [`RetryHandler`](crate::RetryHandler).
#[derive(Debug, Clone)]
pub enum RetryEvent {
    ConfigAdded { config: Arc<RetryConfig> },
    ConfigUpdated { config: Arc<RetryConfig> },
    ConfigRemoved { config_id: String },
    /// The operation eventually succeeded.
    OperationSuccess {
        operation_id: String,
        config_id: String,
        attempts: u32,
        total_duration: Duration,
    },
    /// An attempt failed with a retryable error; the next attempt runs after `delay`.
    OperationRetry {
        operation_id: String,
        config_id: String,
        /// The attempt that just failed (1-indexed)
        attempt: u32,
        delay: Duration,
        error: FailureRecord,
    },
    /// The operation failed for good (not retryable or retries exhausted).
    OperationFailed {
        operation_id: String,
        config_id: String,
        attempts: u32,
        total_duration: Duration,
        error: FailureRecord,
    },
    /// An operation ran past the stale threshold and was dropped from tracking.
    OperationStaleCleanup {
        operation_id: String,
        config_id: String,
        running_for: Duration,
    },
    CircuitBreakerOpen {
        config_id: String,
        failure_count: u32,
        /// Clock time at which the breaker will admit a probe
        reset_at: u64,
    },
    CircuitBreakerHalfOpen { config_id: String },
    CircuitBreakerClosed { config_id: String },
    /// The breaker was forced closed by an operator.
    CircuitBreakerReset { config_id: String },
    DeadLetterAdded { item: DeadLetterItem },
    /// A dead-letter sweep started; `due` items are about to be handed back.
    DeadLetterProcessing { pending: usize, due: usize },
    /// The item was removed from the queue and should be resubmitted by the caller.
    DeadLetterRetryNeeded { item: DeadLetterItem },
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::ConfigAdded { config } => write!(f, "config:added({})", config.id()),
            RateLimitEvent::ConfigUpdated { config } => {
                write!(f, "config:updated({})", config.id())
            }
            RateLimitEvent::ConfigRemoved { config_id } => write!(f, "config:removed({})", config_id),
            RateLimitEvent::ThresholdExceeded { config, remaining, total, .. } => {
                write!(f, "threshold:exceeded({}, {}/{})", config.id(), remaining, total)
            }
            RateLimitEvent::LimitExceeded { config_id, key, retry_after, .. } => {
                write!(f, "limit:exceeded({}, key={}, retry_after={:?})", config_id, key, retry_after)
            }
            RateLimitEvent::CleanupCompleted { removed } => {
                write!(f, "cleanup:completed(removed={})", removed)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::ConfigAdded { config } => write!(f, "config:added({})", config.id()),
            RetryEvent::ConfigUpdated { config } => write!(f, "config:updated({})", config.id()),
            RetryEvent::ConfigRemoved { config_id } => write!(f, "config:removed({})", config_id),
            RetryEvent::OperationSuccess { operation_id, attempts, total_duration, .. } => write!(
                f,
                "operation:success({}, attempts={}, duration={:?})",
                operation_id, attempts, total_duration
            ),
            RetryEvent::OperationRetry { operation_id, attempt, delay, error, .. } => write!(
                f,
                "operation:retry({}, attempt={}, delay={:?}, error={})",
                operation_id, attempt, delay, error
            ),
            RetryEvent::OperationFailed { operation_id, attempts, error, .. } => write!(
                f,
                "operation:failed({}, attempts={}, error={})",
                operation_id, attempts, error
            ),
            RetryEvent::OperationStaleCleanup { operation_id, running_for, .. } => write!(
                f,
                "operation:stale-cleanup({}, running_for={:?})",
                operation_id, running_for
            ),
            RetryEvent::CircuitBreakerOpen { config_id, failure_count, .. } => {
                write!(f, "circuit-breaker:open({}, failures={})", config_id, failure_count)
            }
            RetryEvent::CircuitBreakerHalfOpen { config_id } => {
                write!(f, "circuit-breaker:half-open({})", config_id)
            }
            RetryEvent::CircuitBreakerClosed { config_id } => {
                write!(f, "circuit-breaker:closed({})", config_id)
            }
            RetryEvent::CircuitBreakerReset { config_id } => {
                write!(f, "circuit-breaker:reset({})", config_id)
            }
            RetryEvent::DeadLetterAdded { item } => {
                write!(f, "dead-letter:added({}, operation={})", item.id, item.operation_id)
            }
            RetryEvent::DeadLetterProcessing { pending, due } => {
                write!(f, "dead-letter:processing(pending={}, due={})", pending, due)
            }
            RetryEvent::DeadLetterRetryNeeded { item } => {
                write!(f, "dead-letter:retry-needed({}, operation={})", item.id, item.operation_id)
            }
        }
    }
}

impl RetryEvent {
    /// The config this event concerns, when there is one.
    pub fn config_id(&self) -> Option<&str> {
        match self {
            RetryEvent::ConfigAdded { config } | RetryEvent::ConfigUpdated { config } => {
                Some(config.id())
            }
            RetryEvent::ConfigRemoved { config_id }
            | RetryEvent::OperationSuccess { config_id, .. }
            | RetryEvent::OperationRetry { config_id, .. }
            | RetryEvent::OperationFailed { config_id, .. }
            | RetryEvent::OperationStaleCleanup { config_id, .. }
            | RetryEvent::CircuitBreakerOpen { config_id, .. }
            | RetryEvent::CircuitBreakerHalfOpen { config_id }
            | RetryEvent::CircuitBreakerClosed { config_id }
            | RetryEvent::CircuitBreakerReset { config_id } => Some(config_id),
            RetryEvent::DeadLetterAdded { item } | RetryEvent::DeadLetterRetryNeeded { item } => {
                Some(&item.config_id)
            }
            RetryEvent::DeadLetterProcessing { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_lifecycle_names() {
        let ev = RetryEvent::CircuitBreakerOpen {
            config_id: "payments".into(),
            failure_count: 3,
            reset_at: 10,
        };
        assert_eq!(ev.to_string(), "circuit-breaker:open(payments, failures=3)");
        assert_eq!(ev.config_id(), Some("payments"));

        let ev = RateLimitEvent::CleanupCompleted { removed: 4 };
        assert_eq!(ev.to_string(), "cleanup:completed(removed=4)");

        let ev = RetryEvent::DeadLetterProcessing { pending: 2, due: 1 };
        assert!(ev.config_id().is_none());
    }
}
