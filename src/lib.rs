#![forbid(unsafe_code)]

//! # Tollgate
//!
//! Traffic control for API gateways: per-key rate limiting and resilient retries.
//!
//! ## Features
//!
//! - **Rate limiting** with token bucket, sliding window, fixed window and leaky bucket
//!   algorithms, partitioned by IP, user, organization, API key, endpoint or a custom key
//! - **Retries** with exponential, linear, fixed, Fibonacci or custom backoff and
//!   full, equal or decorrelated jitter
//! - **Circuit breakers** per retry config, with half-open probing
//! - **Dead-letter queues** for operations that exhausted their retries
//! - **Typed lifecycle events** for both components
//! - **Tower middleware** enforcing rate-limit directives
//!
//! Every component takes its clock, sleeper and id generator by injection, so tests run
//! deterministically without real time passing.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tollgate::rate_limit::{Algorithm, Limits, RateLimitConfigSpec, RateLimitContext};
//! use tollgate::retry::{OperationError, RetryConfigSpec};
//! use tollgate::{RateLimiter, RetryHandler, RetryStrategy};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::default();
//!     limiter
//!         .add_config(RateLimitConfigSpec::new(Algorithm::TokenBucket, Limits::new(100, 60)).id("api"))
//!         .unwrap();
//!     let ctx = RateLimitContext::new("198.51.100.4", "GET", "/v1/orders");
//!     let results = limiter.check_limit(&ctx, None).unwrap();
//!     assert!(results.iter().all(|r| r.allowed));
//!
//!     let retries = RetryHandler::default();
//!     retries
//!         .add_config(
//!             RetryConfigSpec::new(RetryStrategy::Exponential)
//!                 .id("upstream")
//!                 .max_retries(2)
//!                 .initial_delay(Duration::from_millis(1)),
//!         )
//!         .unwrap();
//!     let outcome = retries
//!         .execute("upstream", || async { Ok::<_, OperationError>("pong") })
//!         .await
//!         .unwrap();
//!     assert_eq!(outcome.data(), Some(&"pong"));
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod dead_letter;
pub mod error;
pub mod ids;
pub mod jitter;
pub mod maintenance;
pub mod rate_limit;
mod registry;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, BackoffStrategy, RetryStrategy};
pub use circuit_breaker::{CircuitBreakerSettings, CircuitBreakerState, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::{DeadLetterItem, DeadLetterSettings};
pub use error::{ConfigError, ResilienceError};
pub use ids::{IdGenerator, SequentialIds, UuidGenerator};
pub use jitter::{Jitter, JitterKind};
pub use maintenance::MaintenanceHandle;
pub use rate_limit::{RateLimitLayer, RateLimitResult, RateLimiter};
pub use retry::{RetryHandler, RetryResult};
pub use sleeper::{ClockSleeper, InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{EventSink, RateLimitEvent, RetryEvent};
