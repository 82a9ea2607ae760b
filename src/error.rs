//! Error types for traffic-control components
use std::fmt;
use std::time::Duration;

/// Configuration problems: unknown or disabled configs and rejected policy values.
///
/// Returned by the CRUD methods of [`RateLimiter`](crate::RateLimiter) and
/// [`RetryHandler`](crate::RetryHandler), and by `check_limit`/`execute` when the
/// requested config cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No config is registered under this id.
    #[error("config '{id}' not found")]
    NotFound { id: String },
    /// The config exists but is switched off.
    #[error("config '{id}' is disabled")]
    Disabled { id: String },
    /// A config with this id already exists.
    #[error("config '{id}' already exists")]
    DuplicateId { id: String },
    /// Rate limits must be positive integers.
    #[error("invalid limits: {reason}")]
    InvalidLimits { reason: String },
    /// Retry policy values are out of range.
    #[error("invalid retry policy: {reason}")]
    InvalidRetry { reason: String },
    /// Circuit breaker settings are out of range.
    #[error("invalid circuit breaker settings: {reason}")]
    InvalidCircuitBreaker { reason: String },
    /// Dead-letter settings are out of range.
    #[error("invalid dead-letter settings: {reason}")]
    InvalidDeadLetter { reason: String },
}

impl ConfigError {
    pub(crate) fn limits(reason: impl Into<String>) -> Self {
        Self::InvalidLimits { reason: reason.into() }
    }

    pub(crate) fn retry(reason: impl Into<String>) -> Self {
        Self::InvalidRetry { reason: reason.into() }
    }
}

/// Failure of a single guarded execution.
///
/// Carried inside a failed [`RetryResult`](crate::RetryResult) and returned by the
/// rate-limit middleware. `Inner` wraps the operation's own error; every other variant is
/// produced by this crate.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The attempt exceeded the configured per-attempt timeout
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker is open; the operation was never invoked
    CircuitOpen { failure_count: u32, retry_in: Duration },
    /// A rate limit with a `block` action denied the request
    RateLimited { config_id: String, retry_after: Option<Duration> },
    /// The config could not be resolved
    Config(ConfigError),
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { failure_count, retry_in } => {
                write!(
                    f,
                    "circuit breaker is open ({} failures, retry in {:?})",
                    failure_count, retry_in
                )
            }
            Self::RateLimited { config_id, retry_after: Some(wait) } => {
                write!(f, "rate limit '{}' exceeded, retry after {:?}", config_id, wait)
            }
            Self::RateLimited { config_id, retry_after: None } => {
                write!(f, "rate limit '{}' exceeded", config_id)
            }
            Self::Config(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<ConfigError> for ResilienceError<E> {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is a rate-limit rejection
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Suggested wait for rate-limit and circuit-open rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    #[test]
    fn timeout_error_display() {
        let err: ResilienceError<io::Error> = ResilienceError::Timeout {
            elapsed: Duration::from_millis(5100),
            timeout: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5.1"));
    }

    #[test]
    fn circuit_open_display_mentions_breaker() {
        let err: ResilienceError<DummyError> =
            ResilienceError::CircuitOpen { failure_count: 3, retry_in: Duration::from_secs(30) };
        assert!(err.to_string().contains("circuit breaker is open"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rate_limited_display_with_and_without_wait() {
        let err: ResilienceError<DummyError> = ResilienceError::RateLimited {
            config_id: "per-ip".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(err.is_rate_limited());
        assert!(err.to_string().contains("per-ip"));
        let bare: ResilienceError<DummyError> =
            ResilienceError::RateLimited { config_id: "g".into(), retry_after: None };
        assert_eq!(bare.to_string(), "rate limit 'g' exceeded");
    }

    #[test]
    fn config_error_converts_and_sources() {
        let err: ResilienceError<DummyError> = ConfigError::NotFound { id: "x".into() }.into();
        assert_eq!(err.to_string(), "config 'x' not found");
        assert!(err.source().is_some());
    }

    #[test]
    fn inner_accessors_work() {
        let err = ResilienceError::Inner(DummyError("boom"));
        assert!(err.is_inner());
        assert_eq!(err.as_inner(), Some(&DummyError("boom")));
        assert_eq!(err.source().map(|s| s.to_string()), Some("boom".to_string()));
        assert_eq!(err.into_inner(), Some(DummyError("boom")));
    }

    #[test]
    fn source_is_none_for_timeout() {
        let err: ResilienceError<DummyError> = ResilienceError::Timeout {
            elapsed: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
        };
        assert!(err.source().is_none());
        assert!(err.is_timeout());
        assert!(!err.is_circuit_open());
    }
}
