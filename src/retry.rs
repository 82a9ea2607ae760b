//! Resilient execution of outbound operations.
//!
//! - [`RetryHandler`]: owns named [`RetryConfig`]s, runs operations through the retry
//!   loop, and keeps the per-config circuit breakers and dead-letter queues.
//! - [`classify`]: how operation errors are described and matched against
//!   [`RetryConditions`].
//!
//! Unknown or disabled configs are rejected up front with a
//! [`ConfigError`](crate::ConfigError); every other outcome, including an open circuit,
//! comes back as a [`RetryResult`] so callers always see `attempts` and
//! `total_duration` next to the failure.

pub mod classify;
pub mod config;
pub mod handler;

pub use classify::{Classify, FailureRecord, OperationError, RetryConditions};
pub use config::{RetryConfig, RetryConfigSpec, RetryConfigUpdate};
pub use handler::{
    ExecuteOptions, RetryContext, RetryHandler, RetryHandlerBuilder, RetryHandlerOptions,
    RetryResult, RetryStats,
};
