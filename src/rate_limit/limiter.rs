use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::strategies::{self, Evaluation};
use super::{
    InMemoryStateStore, RateLimitConfig, RateLimitConfigSpec, RateLimitConfigUpdate,
    RateLimitContext, RateLimitResult, RateLimitState, StateKey, StateStore,
};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::maintenance::{spawn_periodic, MaintenanceHandle};
use crate::registry::ConfigRegistry;
use crate::telemetry::{EventSink, Listeners, RateLimitEvent, SubscriptionId};

/// Tunables for [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimiterOptions {
    /// Period of the expired-state sweep started by [`RateLimiter::spawn_cleanup_loop`]
    pub cleanup_interval: Duration,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self { cleanup_interval: Duration::from_secs(5 * 60) }
    }
}

/// Multi-config, multi-algorithm rate limiter.
///
/// Owns its configs and all per-key state. Share it behind an `Arc`; every method takes
/// `&self`.
///
/// ```rust
/// use tollgate::rate_limit::{Algorithm, Limits, RateLimitConfigSpec, RateLimitContext};
/// use tollgate::RateLimiter;
///
/// let limiter = RateLimiter::default();
/// limiter
///     .add_config(RateLimitConfigSpec::new(Algorithm::TokenBucket, Limits::new(2, 1)).id("ip"))
///     .unwrap();
///
/// let ctx = RateLimitContext::new("198.51.100.4", "GET", "/v1/orders");
/// let results = limiter.check_limit(&ctx, None).unwrap();
/// assert!(results.iter().all(|r| r.allowed));
/// ```
pub struct RateLimiter {
    configs: ConfigRegistry<RateLimitConfig>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    listeners: Listeners<RateLimitEvent>,
    options: RateLimiterOptions,
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self::builder().options(options).build()
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    pub fn options(&self) -> &RateLimiterOptions {
        &self.options
    }

    /// Register a config. The id is taken from the spec or generated.
    pub fn add_config(&self, spec: RateLimitConfigSpec) -> Result<Arc<RateLimitConfig>, ConfigError> {
        let id = spec.id.clone().unwrap_or_else(|| self.ids.next_id());
        let config = spec.into_config(id.clone(), self.clock.now_millis())?;
        let config = self.configs.insert(id, config)?;
        tracing::info!(
            config_id = %config.id(),
            algorithm = ?config.algorithm(),
            requests = config.limits().requests,
            window_secs = config.limits().window_secs,
            "rate limit config added"
        );
        self.listeners.emit(&RateLimitEvent::ConfigAdded { config: config.clone() });
        Ok(config)
    }

    /// Apply `update` to the config under `id`. Returns `Ok(None)` for an unknown id.
    ///
    /// Switching the algorithm discards the config's per-key state, since the old state
    /// has no meaning under the new algorithm.
    pub fn update_config(
        &self,
        id: &str,
        update: RateLimitConfigUpdate,
    ) -> Result<Option<Arc<RateLimitConfig>>, ConfigError> {
        let now = self.clock.now_millis();
        let Some((old, new)) = self.configs.update(id, |current| update.apply(current, now))? else {
            return Ok(None);
        };
        if old.algorithm() != new.algorithm() {
            let dropped = self.purge_state(id);
            tracing::debug!(config_id = id, dropped, "algorithm changed, state discarded");
        }
        tracing::info!(config_id = id, "rate limit config updated");
        self.listeners.emit(&RateLimitEvent::ConfigUpdated { config: new.clone() });
        Ok(Some(new))
    }

    /// Remove a config and every piece of state partitioned under it.
    pub fn remove_config(&self, id: &str) -> bool {
        if self.configs.remove(id).is_none() {
            return false;
        }
        let dropped = self.purge_state(id);
        tracing::info!(config_id = id, dropped, "rate limit config removed");
        self.listeners.emit(&RateLimitEvent::ConfigRemoved { config_id: id.to_string() });
        true
    }

    pub fn get_config(&self, id: &str) -> Option<Arc<RateLimitConfig>> {
        self.configs.get(id)
    }

    /// All configs in evaluation order.
    pub fn list_configs(&self) -> Vec<Arc<RateLimitConfig>> {
        self.configs.snapshot()
    }

    /// Evaluate `ctx` against one config, or against every applicable config.
    ///
    /// With `config_id`, only that config is checked; unknown or disabled ids are
    /// errors. Without it, every enabled config whose scope applies to `ctx` is checked
    /// in insertion order, stopping at the first result that is denied with a `block`
    /// action. That blocking result is the last element of the returned list.
    pub fn check_limit(
        &self,
        ctx: &RateLimitContext,
        config_id: Option<&str>,
    ) -> Result<Vec<RateLimitResult>, ConfigError> {
        let candidates = match config_id {
            Some(id) => {
                let config =
                    self.configs.get(id).ok_or_else(|| ConfigError::NotFound { id: id.to_string() })?;
                if !config.is_enabled() {
                    return Err(ConfigError::Disabled { id: id.to_string() });
                }
                vec![config]
            }
            None => self
                .configs
                .snapshot()
                .into_iter()
                .filter(|c| c.is_enabled() && c.scope().applies_to(ctx))
                .collect(),
        };

        let now = self.clock.now_millis();
        let mut results = Vec::with_capacity(candidates.len());
        for config in candidates {
            let result = self.check_one(config, ctx, now);
            let blocking = result.is_blocking();
            results.push(result);
            if blocking {
                break;
            }
        }
        Ok(results)
    }

    fn check_one(&self, config: Arc<RateLimitConfig>, ctx: &RateLimitContext, now: u64) -> RateLimitResult {
        let key = config.key_strategy().derive(ctx);
        let limits = *config.limits();

        if config.exemptions().contains(&key) {
            tracing::trace!(config_id = %config.id(), %key, "exempt key");
            return RateLimitResult {
                allowed: true,
                remaining: limits.requests,
                reset_at: now,
                retry_after: None,
                action: config.action(),
                config,
            };
        }

        let algorithm = config.algorithm();
        let mut eval =
            Evaluation { allowed: true, remaining: limits.requests, reset_at: now, retry_after: None };
        self.store.update(
            &StateKey::new(config.id(), key.as_str()),
            &|| RateLimitState::new(algorithm, &limits, now),
            &mut |state| eval = strategies::evaluate(algorithm, &limits, state, now),
        );

        tracing::trace!(
            config_id = %config.id(),
            %key,
            allowed = eval.allowed,
            remaining = eval.remaining,
            "rate limit checked"
        );

        if !eval.allowed {
            tracing::debug!(
                config_id = %config.id(),
                %key,
                retry_after_secs = eval.retry_after.map(|d| d.as_secs()),
                action = ?config.action(),
                "rate limit exceeded"
            );
            self.listeners.emit(&RateLimitEvent::LimitExceeded {
                config_id: config.id().to_string(),
                key,
                remaining: eval.remaining,
                retry_after: eval.retry_after,
            });
        }

        if let Some(floor) = config.notify_floor() {
            if eval.remaining <= floor {
                self.listeners.emit(&RateLimitEvent::ThresholdExceeded {
                    config: config.clone(),
                    context: ctx.clone(),
                    remaining: eval.remaining,
                    total: limits.requests,
                });
            }
        }

        RateLimitResult {
            allowed: eval.allowed,
            remaining: eval.remaining,
            reset_at: eval.reset_at,
            retry_after: eval.retry_after,
            action: config.action(),
            config,
        }
    }

    /// Snapshot of the state for one partition.
    pub fn get_state(&self, config_id: &str, key: &str) -> Option<RateLimitState> {
        self.store.get(&StateKey::new(config_id, key))
    }

    /// Forget one partition so its next request starts fresh.
    pub fn reset_key(&self, config_id: &str, key: &str) -> bool {
        let removed = self.store.remove(&StateKey::new(config_id, key));
        if removed {
            tracing::debug!(config_id, key, "rate limit key reset");
        }
        removed
    }

    /// Number of `(config, key)` partitions currently holding state.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    /// Drop state untouched for more than twice its config's window, and state whose
    /// config no longer exists. Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let ttls: HashMap<String, u64> =
            self.configs.snapshot().iter().map(|c| (c.id().to_string(), c.state_ttl_ms())).collect();
        let now = self.clock.now_millis();
        let removed = self.store.retain(&mut |key, state| match ttls.get(&key.config_id) {
            Some(&ttl) => now.saturating_sub(state.updated_at) <= ttl,
            None => false,
        });
        tracing::debug!(removed, remaining = self.store.len(), "rate limit cleanup completed");
        self.listeners.emit(&RateLimitEvent::CleanupCompleted { removed });
        removed
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `options.cleanup_interval`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn_cleanup_loop(self: &Arc<Self>) -> MaintenanceHandle {
        MaintenanceHandle::new(vec![spawn_periodic(
            "rate_limit_cleanup",
            Arc::downgrade(self),
            self.options.cleanup_interval,
            |limiter: &RateLimiter| {
                limiter.cleanup_expired();
            },
        )])
    }

    pub fn subscribe<S>(&self, sink: S) -> SubscriptionId
    where
        S: EventSink<RateLimitEvent> + 'static,
    {
        self.listeners.subscribe(sink)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn purge_state(&self, config_id: &str) -> usize {
        self.store.retain(&mut |key, _| key.config_id != config_id)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("configs", &self.configs.len())
            .field("tracked_keys", &self.store.len())
            .field("listeners", &self.listeners.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Builder for [`RateLimiter`] with injectable clock, id generator and state store.
#[derive(Default)]
pub struct RateLimiterBuilder {
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    store: Option<Arc<dyn StateStore>>,
    options: RateLimiterOptions,
}

impl RateLimiterBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn ids(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(mut self, options: RateLimiterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            configs: ConfigRegistry::new(),
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryStateStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            listeners: Listeners::new(),
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::SequentialIds;
    use crate::rate_limit::{Algorithm, KeyStrategy, Limits, Scope, ViolationAction};
    use crate::telemetry::MemorySink;

    fn limiter(clock: &ManualClock) -> RateLimiter {
        RateLimiter::builder().clock(clock.clone()).ids(SequentialIds::new("rl")).build()
    }

    fn ctx() -> RateLimitContext {
        RateLimitContext::new("10.1.1.1", "GET", "/v1/items")
    }

    #[test]
    fn generated_ids_and_events() {
        let clock = ManualClock::new(1_000);
        let limiter = limiter(&clock);
        let sink = MemorySink::new();
        limiter.subscribe(sink.clone());

        let config = limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(5, 60)))
            .unwrap();
        assert_eq!(config.id(), "rl-1");
        assert_eq!(config.created_at(), 1_000);
        assert!(limiter.remove_config("rl-1"));
        assert!(!limiter.remove_config("rl-1"));

        let names: Vec<String> = sink.events().iter().map(|e| e.to_string()).collect();
        assert_eq!(names, vec!["config:added(rl-1)", "config:removed(rl-1)"]);
    }

    #[test]
    fn rejects_invalid_limits_and_duplicates() {
        let limiter = limiter(&ManualClock::new(0));
        let err = limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::TokenBucket, Limits::new(0, 1)))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLimits { .. }));

        let spec = RateLimitConfigSpec::new(Algorithm::TokenBucket, Limits::new(1, 1)).id("a");
        limiter.add_config(spec.clone()).unwrap();
        assert!(matches!(limiter.add_config(spec), Err(ConfigError::DuplicateId { .. })));
    }

    #[test]
    fn explicit_id_must_exist_and_be_enabled() {
        let limiter = limiter(&ManualClock::new(0));
        let spec =
            RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(1, 1)).id("off").disabled();
        limiter.add_config(spec).unwrap();

        assert_eq!(
            limiter.check_limit(&ctx(), Some("nope")).unwrap_err(),
            ConfigError::NotFound { id: "nope".into() }
        );
        assert_eq!(
            limiter.check_limit(&ctx(), Some("off")).unwrap_err(),
            ConfigError::Disabled { id: "off".into() }
        );
        assert!(limiter.check_limit(&ctx(), None).unwrap().is_empty());
    }

    #[test]
    fn scope_filters_configs() {
        let limiter = limiter(&ManualClock::new(0));
        limiter
            .add_config(
                RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(5, 60))
                    .id("users")
                    .scope(Scope::User)
                    .key(KeyStrategy::User),
            )
            .unwrap();
        limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(5, 60)).id("all"))
            .unwrap();

        let anon = limiter.check_limit(&ctx(), None).unwrap();
        assert_eq!(anon.len(), 1);
        assert_eq!(anon[0].config.id(), "all");

        let user = limiter.check_limit(&ctx().with_user("u1"), None).unwrap();
        let ids: Vec<&str> = user.iter().map(|r| r.config.id()).collect();
        assert_eq!(ids, vec!["users", "all"]);
        assert!(limiter.get_state("users", "u1").is_some());
    }

    #[test]
    fn non_blocking_denial_does_not_short_circuit() {
        let limiter = limiter(&ManualClock::new(0));
        limiter
            .add_config(
                RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(1, 60))
                    .id("soft")
                    .action(ViolationAction::Delay { delay: Duration::from_millis(200) }),
            )
            .unwrap();
        limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(10, 60)).id("hard"))
            .unwrap();

        limiter.check_limit(&ctx(), None).unwrap();
        let results = limiter.check_limit(&ctx(), None).unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[0].allowed);
        assert_eq!(results[0].action, ViolationAction::Delay { delay: Duration::from_millis(200) });
        assert!(results[1].allowed);
    }

    #[test]
    fn cleanup_drops_expired_and_orphaned_state() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let sink = MemorySink::new();
        limiter.subscribe(sink.clone());
        limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::SlidingWindow, Limits::new(5, 10)).id("w"))
            .unwrap();

        limiter.check_limit(&ctx(), None).unwrap();
        clock.advance(15_000);
        limiter.check_limit(&RateLimitContext::new("10.9.9.9", "GET", "/"), None).unwrap();
        assert_eq!(limiter.tracked_keys(), 2);

        clock.advance(6_000);
        assert_eq!(limiter.cleanup_expired(), 1);
        assert!(limiter.get_state("w", "10.1.1.1").is_none());
        assert!(limiter.get_state("w", "10.9.9.9").is_some());

        assert!(limiter.remove_config("w"));
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, RateLimitEvent::CleanupCompleted { removed: 1 })));
    }

    #[test]
    fn algorithm_change_discards_state() {
        let limiter = limiter(&ManualClock::new(0));
        limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(1, 60)).id("x"))
            .unwrap();
        limiter.check_limit(&ctx(), None).unwrap();
        assert_eq!(limiter.tracked_keys(), 1);

        let mut update = RateLimitConfigUpdate::new();
        update.algorithm = Some(Algorithm::TokenBucket);
        let updated = limiter.update_config("x", update).unwrap().unwrap();
        assert_eq!(updated.algorithm(), Algorithm::TokenBucket);
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.update_config("missing", RateLimitConfigUpdate::new()).unwrap().is_none());
    }

    #[test]
    fn reset_key_unblocks_partition() {
        let limiter = limiter(&ManualClock::new(0));
        limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(1, 60)).id("x"))
            .unwrap();
        assert!(limiter.check_limit(&ctx(), Some("x")).unwrap()[0].allowed);
        assert!(!limiter.check_limit(&ctx(), Some("x")).unwrap()[0].allowed);
        assert!(limiter.reset_key("x", "10.1.1.1"));
        assert!(limiter.check_limit(&ctx(), Some("x")).unwrap()[0].allowed);
    }
}
