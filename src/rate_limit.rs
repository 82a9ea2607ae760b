//! Rate limiting.
//!
//! - [`RateLimiter`]: owns named [`RateLimitConfig`]s and the per-key state behind them,
//!   and answers [`RateLimiter::check_limit`] for each request.
//! - [`strategies`]: the four admission algorithms (token bucket, sliding window, fixed
//!   window, leaky bucket) as pure functions over [`RateLimitState`].
//! - [`store`]: the [`StateStore`] seam; [`InMemoryStateStore`] serializes updates per key.
//! - [`key`]: how a request is mapped to a partition key.
//! - [`RateLimitLayer`]: Tower middleware enacting the limiter's directives.
//!
//! A denial is not an error: it is a [`RateLimitResult`] with `allowed == false` and the
//! config's [`ViolationAction`], which the caller enacts.

use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod key;
pub mod limiter;
pub mod middleware;
pub mod store;
pub mod strategies;

pub use config::{RateLimitConfig, RateLimitConfigSpec, RateLimitConfigUpdate};
pub use key::{KeyFn, KeyStrategy};
pub use limiter::{RateLimiter, RateLimiterBuilder, RateLimiterOptions};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{InMemoryStateStore, RateLimitState, StateKey, StateStore};

/// Admission algorithm of a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

/// Which requests a config applies to when `check_limit` evaluates every config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Scope {
    /// Always applies.
    Global,
    /// Applies when the request carries a user id.
    User,
    /// Applies when the request carries an organization id.
    Organization,
    /// Applies when the request has a client address.
    Ip,
    /// Applies when the request carries an API key.
    ApiKey,
    /// Always applies; the key strategy decides the partition.
    Custom,
}

impl Scope {
    pub fn applies_to(&self, ctx: &RateLimitContext) -> bool {
        match self {
            Scope::Global | Scope::Custom => true,
            Scope::User => ctx.user_id.is_some(),
            Scope::Organization => ctx.organization_id.is_some(),
            Scope::Ip => !ctx.ip_address.is_empty(),
            Scope::ApiKey => ctx.api_key.is_some(),
        }
    }
}

/// Request budget of a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Limits {
    /// Requests allowed per window
    pub requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Bucket capacity for token/leaky bucket; defaults to `requests`
    #[cfg_attr(feature = "serde", serde(default))]
    pub burst: Option<u64>,
}

impl Limits {
    pub fn new(requests: u64, window_secs: u64) -> Self {
        Self { requests, window_secs, burst: None }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    /// Bucket size: `burst`, or `requests` when no burst is set.
    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.requests)
    }

    /// Refill (token bucket) or drain (leaky bucket) rate in units per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.requests as f64 / self.window_secs as f64
    }

    pub(crate) fn validate(&self) -> Result<(), crate::ConfigError> {
        if self.requests == 0 {
            return Err(crate::ConfigError::limits("requests must be > 0"));
        }
        if self.window_secs == 0 {
            return Err(crate::ConfigError::limits("window must be > 0 seconds"));
        }
        if self.burst == Some(0) {
            return Err(crate::ConfigError::limits("burst must be > 0 when set"));
        }
        Ok(())
    }
}

/// What a denied request should experience. The limiter only reports it.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum ViolationAction {
    /// Reject the request.
    Block,
    /// Hold the request for `delay`, then let it through.
    Delay { delay: Duration },
    /// Admit only a `ratio` share of the traffic.
    Throttle { ratio: f64 },
}

impl ViolationAction {
    pub fn is_block(&self) -> bool {
        matches!(self, ViolationAction::Block)
    }
}

/// Request descriptor the gateway builds for every incoming call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitContext {
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub ip_address: String,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub method: String,
    /// Request time as seen by the caller, informational only
    pub timestamp: Option<u64>,
}

impl RateLimitContext {
    pub fn new(
        ip_address: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            ip_address: ip_address.into(),
            method: method.into(),
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Outcome of checking one config.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    /// Clock time (ms) at which the quota is fully or partially restored
    pub reset_at: u64,
    /// Whole seconds to wait before retrying; set only when denied
    pub retry_after: Option<Duration>,
    /// The config's action, reported verbatim
    pub action: ViolationAction,
    pub config: Arc<RateLimitConfig>,
}

impl RateLimitResult {
    /// True when this result must stop the request (`allowed == false` and `block`).
    pub fn is_blocking(&self) -> bool {
        !self.allowed && self.action.is_block()
    }

    /// Standard rate-limit response headers for this result.
    ///
    /// `X-RateLimit-Reset` is in whole seconds of the limiter's clock; `Retry-After` is
    /// present only on denial.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.config.limits().requests.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", (self.reset_at.saturating_add(999) / 1000).to_string()),
        ];
        if let Some(wait) = self.retry_after {
            headers.push(("Retry-After", wait.as_secs().to_string()));
        }
        headers
    }
}
