//! Rate-limit policies: the stored [`RateLimitConfig`], the [`RateLimitConfigSpec`]
//! used to create one and the [`RateLimitConfigUpdate`] patch used to change one.

use std::collections::HashSet;

use super::{Algorithm, KeyStrategy, Limits, Scope, ViolationAction};
use crate::error::ConfigError;

/// A registered rate-limit policy.
///
/// Immutable once stored; updates replace the whole snapshot.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitConfig {
    pub(crate) id: String,
    pub(crate) algorithm: Algorithm,
    pub(crate) limits: Limits,
    pub(crate) key: KeyStrategy,
    pub(crate) scope: Scope,
    pub(crate) action: ViolationAction,
    pub(crate) exemptions: HashSet<String>,
    pub(crate) notify_threshold: Option<u8>,
    pub(crate) enabled: bool,
    pub(crate) created_at: u64,
    pub(crate) updated_at: u64,
}

impl RateLimitConfig {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn action(&self) -> ViolationAction {
        self.action
    }

    pub fn exemptions(&self) -> &HashSet<String> {
        &self.exemptions
    }

    /// Percentage of `requests` at or below which remaining quota triggers a notification.
    pub fn notify_threshold(&self) -> Option<u8> {
        self.notify_threshold
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

    /// State untouched for longer than this is expired: twice the window.
    pub fn state_ttl_ms(&self) -> u64 {
        self.limits.window_ms().saturating_mul(2)
    }

    /// Remaining quota at or below which `threshold:exceeded` fires.
    pub(crate) fn notify_floor(&self) -> Option<u64> {
        self.notify_threshold.map(|pct| self.limits.requests.saturating_mul(u64::from(pct)) / 100)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        if let ViolationAction::Throttle { ratio } = self.action {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::limits(format!(
                    "throttle ratio must be in (0, 1] (got {})",
                    ratio
                )));
            }
        }
        if let Some(pct) = self.notify_threshold {
            if pct == 0 || pct > 100 {
                return Err(ConfigError::limits(format!(
                    "notification threshold must be 1..=100 percent (got {})",
                    pct
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to register a config; id and timestamps are assigned on insert.
///
/// ```rust
/// use tollgate::rate_limit::{Algorithm, KeyStrategy, Limits, RateLimitConfigSpec, Scope};
///
/// let spec = RateLimitConfigSpec::new(Algorithm::SlidingWindow, Limits::new(100, 60))
///     .id("per-user")
///     .scope(Scope::User)
///     .key(KeyStrategy::User)
///     .notify_at(80);
/// # let _ = spec;
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitConfigSpec {
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: Option<String>,
    pub algorithm: Algorithm,
    pub limits: Limits,
    pub key: KeyStrategy,
    pub scope: Scope,
    pub action: ViolationAction,
    #[cfg_attr(feature = "serde", serde(default))]
    pub exemptions: HashSet<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub notify_threshold: Option<u8>,
    #[cfg_attr(feature = "serde", serde(default = "enabled_by_default"))]
    pub enabled: bool,
}

impl RateLimitConfigSpec {
    /// Global, IP-keyed, blocking config.
    pub fn new(algorithm: Algorithm, limits: Limits) -> Self {
        Self {
            id: None,
            algorithm,
            limits,
            key: KeyStrategy::Ip,
            scope: Scope::Global,
            action: ViolationAction::Block,
            exemptions: HashSet::new(),
            notify_threshold: None,
            enabled: true,
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn key(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn action(mut self, action: ViolationAction) -> Self {
        self.action = action;
        self
    }

    /// Never limit requests whose derived key is `key`.
    pub fn exempt(mut self, key: impl Into<String>) -> Self {
        self.exemptions.insert(key.into());
        self
    }

    pub fn notify_at(mut self, percent: u8) -> Self {
        self.notify_threshold = Some(percent);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn into_config(self, id: String, now: u64) -> Result<RateLimitConfig, ConfigError> {
        let config = RateLimitConfig {
            id,
            algorithm: self.algorithm,
            limits: self.limits,
            key: self.key,
            scope: self.scope,
            action: self.action,
            exemptions: self.exemptions,
            notify_threshold: self.notify_threshold,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Partial update; `None` fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfigUpdate {
    pub algorithm: Option<Algorithm>,
    pub limits: Option<Limits>,
    pub key: Option<KeyStrategy>,
    pub scope: Option<Scope>,
    pub action: Option<ViolationAction>,
    pub exemptions: Option<HashSet<String>>,
    /// `Some(None)` clears the threshold
    pub notify_threshold: Option<Option<u8>>,
    pub enabled: Option<bool>,
}

impl RateLimitConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn action(mut self, action: ViolationAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn exemptions<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exemptions = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn notify_threshold(mut self, percent: Option<u8>) -> Self {
        self.notify_threshold = Some(percent);
        self
    }

    pub(crate) fn apply(
        self,
        current: &RateLimitConfig,
        now: u64,
    ) -> Result<RateLimitConfig, ConfigError> {
        let mut next = current.clone();
        if let Some(algorithm) = self.algorithm {
            next.algorithm = algorithm;
        }
        if let Some(limits) = self.limits {
            next.limits = limits;
        }
        if let Some(key) = self.key {
            next.key = key;
        }
        if let Some(scope) = self.scope {
            next.scope = scope;
        }
        if let Some(action) = self.action {
            next.action = action;
        }
        if let Some(exemptions) = self.exemptions {
            next.exemptions = exemptions;
        }
        if let Some(threshold) = self.notify_threshold {
            next.notify_threshold = threshold;
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
