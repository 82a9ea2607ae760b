use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{Classify, FailureRecord, RetryConfig, RetryConfigSpec, RetryConfigUpdate};
use crate::circuit_breaker::{CircuitBreakerState, Transition};
use crate::clock::{Clock, SystemClock};
use crate::dead_letter::{DeadLetterItem, DeadLetterQueue};
use crate::error::{ConfigError, ResilienceError};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::maintenance::{spawn_periodic, MaintenanceHandle};
use crate::registry::ConfigRegistry;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{EventSink, Listeners, RetryEvent, SubscriptionId};

/// Tunables for [`RetryHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryHandlerOptions {
    /// Period of the dead-letter sweep
    pub dead_letter_interval: Duration,
    /// Operations tracked for longer than this are dropped by the stale sweep
    pub stale_after: Duration,
    /// Period of the stale-operation sweep
    pub stale_sweep_interval: Duration,
}

impl Default for RetryHandlerOptions {
    fn default() -> Self {
        Self {
            dead_letter_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(60 * 60),
            stale_sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Per-call options for [`RetryHandler::execute_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Caller-chosen operation id; generated when absent
    pub operation_id: Option<String>,
    /// Copied into the dead-letter item so the host can replay the operation
    pub metadata: BTreeMap<String, String>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Bookkeeping for one in-flight `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryContext {
    pub operation_id: String,
    pub config_id: String,
    /// Attempt currently running (1-indexed)
    pub attempt: u32,
    pub started_at: u64,
    pub last_error: Option<FailureRecord>,
    pub metadata: BTreeMap<String, String>,
}

/// Outcome of [`RetryHandler::execute`].
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: Result<T, ResilienceError<E>>,
    /// Attempts made; 0 when the circuit breaker rejected the call
    pub attempts: u32,
    pub total_duration: Duration,
    pub operation_id: String,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// True when the operation was never invoked because the breaker is open.
    pub fn circuit_breaker_open(&self) -> bool {
        matches!(self.result, Err(ResilienceError::CircuitOpen { .. }))
    }

    pub fn data(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ResilienceError<E>> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, ResilienceError<E>> {
        self.result
    }
}

/// Snapshot returned by [`RetryHandler::get_stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryStats {
    pub total_configs: usize,
    pub active_operations: usize,
    pub open_circuit_breakers: usize,
    pub dead_letter_queue_size: usize,
    /// Sorted
    pub active_operation_ids: Vec<String>,
}

/// Retry executor with per-config circuit breakers and dead-letter queues.
///
/// ```rust
/// use std::time::Duration;
/// use tollgate::retry::{OperationError, RetryConfigSpec};
/// use tollgate::{InstantSleeper, RetryHandler, RetryStrategy};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let handler = RetryHandler::builder().sleeper(InstantSleeper).build();
/// handler
///     .add_config(
///         RetryConfigSpec::new(RetryStrategy::Fixed)
///             .id("connector")
///             .max_retries(2)
///             .initial_delay(Duration::from_millis(10)),
///     )
///     .unwrap();
///
/// let mut calls = 0;
/// let result = handler
///     .execute("connector", || {
///         calls += 1;
///         let outcome = if calls < 2 { Err(OperationError::new("NetworkError", "reset")) } else { Ok(calls) };
///         async move { outcome }
///     })
///     .await
///     .unwrap();
/// assert_eq!(result.data(), Some(&2));
/// assert_eq!(result.attempts, 2);
/// # }
/// ```
pub struct RetryHandler {
    configs: ConfigRegistry<RetryConfig>,
    breakers: Mutex<HashMap<String, CircuitBreakerState>>,
    dead_letters: DeadLetterQueue,
    /// Keyed by a per-call slot, so caller-chosen operation ids may repeat
    active: Mutex<HashMap<u64, RetryContext>>,
    next_slot: AtomicU64,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    ids: Arc<dyn IdGenerator>,
    listeners: Listeners<RetryEvent>,
    options: RetryHandlerOptions,
}

/// Removes an operation from the active map when `execute` finishes or is dropped.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<u64, RetryContext>>,
    slot: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.slot);
    }
}

impl RetryHandler {
    pub fn new(options: RetryHandlerOptions) -> Self {
        Self::builder().options(options).build()
    }

    pub fn builder() -> RetryHandlerBuilder {
        RetryHandlerBuilder::default()
    }

    pub fn options(&self) -> &RetryHandlerOptions {
        &self.options
    }

    /// Register a config, creating its circuit breaker when one is configured.
    pub fn add_config(&self, spec: RetryConfigSpec) -> Result<Arc<RetryConfig>, ConfigError> {
        let id = spec.id.clone().unwrap_or_else(|| self.ids.next_id());
        let now = self.clock.now_millis();
        let config = self.configs.insert(id.clone(), spec.into_config(id, now)?)?;
        if config.circuit_breaker().is_some() {
            self.lock_breakers().insert(config.id().to_string(), CircuitBreakerState::new(now));
        }
        tracing::info!(
            config_id = %config.id(),
            strategy = ?config.strategy(),
            max_retries = config.max_retries(),
            circuit_breaker = config.circuit_breaker().is_some(),
            dead_letter = config.dead_letter().is_some(),
            "retry config added"
        );
        self.listeners.emit(&RetryEvent::ConfigAdded { config: config.clone() });
        Ok(config)
    }

    /// Apply `update` to the config under `id`. Returns `Ok(None)` for an unknown id.
    ///
    /// Turning the circuit breaker on creates a fresh closed breaker; turning it off
    /// discards the breaker state.
    pub fn update_config(
        &self,
        id: &str,
        update: RetryConfigUpdate,
    ) -> Result<Option<Arc<RetryConfig>>, ConfigError> {
        let now = self.clock.now_millis();
        let Some((old, new)) = self.configs.update(id, |current| update.apply(current, now))? else {
            return Ok(None);
        };
        match (old.circuit_breaker().is_some(), new.circuit_breaker().is_some()) {
            (false, true) => {
                self.lock_breakers().insert(id.to_string(), CircuitBreakerState::new(now));
            }
            (true, false) => {
                self.lock_breakers().remove(id);
            }
            _ => {}
        }
        tracing::info!(config_id = id, "retry config updated");
        self.listeners.emit(&RetryEvent::ConfigUpdated { config: new.clone() });
        Ok(Some(new))
    }

    /// Remove a config together with its breaker state and dead-letter items.
    pub fn remove_config(&self, id: &str) -> bool {
        if self.configs.remove(id).is_none() {
            return false;
        }
        self.lock_breakers().remove(id);
        let dropped = self.dead_letters.clear(Some(id));
        tracing::info!(config_id = id, dead_letters_dropped = dropped, "retry config removed");
        self.listeners.emit(&RetryEvent::ConfigRemoved { config_id: id.to_string() });
        true
    }

    pub fn get_config(&self, id: &str) -> Option<Arc<RetryConfig>> {
        self.configs.get(id)
    }

    /// All configs in insertion order.
    pub fn list_configs(&self) -> Vec<Arc<RetryConfig>> {
        self.configs.snapshot()
    }

    /// Run `operation` under the config `config_id` with a generated operation id.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        config_id: &str,
        operation: Op,
    ) -> Result<RetryResult<T, E>, ConfigError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.execute_with(config_id, ExecuteOptions::default(), operation).await
    }

    /// Run `operation` under the config `config_id`.
    ///
    /// Fails fast with a [`ConfigError`] when the config is unknown or disabled. An open
    /// circuit breaker yields a result with `attempts == 0` without calling `operation`.
    /// Otherwise attempts run strictly one after another, each bounded by the config's
    /// timeout, until one succeeds, a failure is not retryable, or `max_retries + 1`
    /// attempts have been made. A timed-out attempt is cancelled: its future is dropped
    /// at the deadline, so work it has not reached yet never runs.
    pub async fn execute_with<T, E, Fut, Op>(
        &self,
        config_id: &str,
        options: ExecuteOptions,
        mut operation: Op,
    ) -> Result<RetryResult<T, E>, ConfigError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let config =
            self.configs.get(config_id).ok_or_else(|| ConfigError::NotFound { id: config_id.to_string() })?;
        if !config.is_enabled() {
            return Err(ConfigError::Disabled { id: config_id.to_string() });
        }

        let ExecuteOptions { operation_id, metadata } = options;
        let operation_id = operation_id.unwrap_or_else(|| self.ids.next_id());
        let started_at = self.clock.now_millis();

        if let Some((failure_count, retry_in)) = self.admit(&config, started_at) {
            tracing::debug!(
                config_id,
                operation_id = %operation_id,
                retry_in_ms = retry_in.as_millis() as u64,
                "circuit open, operation rejected"
            );
            return Ok(RetryResult {
                result: Err(ResilienceError::CircuitOpen { failure_count, retry_in }),
                attempts: 0,
                total_duration: Duration::ZERO,
                operation_id,
            });
        }

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.lock_active().insert(
            slot,
            RetryContext {
                operation_id: operation_id.clone(),
                config_id: config_id.to_string(),
                attempt: 0,
                started_at,
                last_error: None,
                metadata: metadata.clone(),
            },
        );
        let _guard = ActiveGuard { active: &self.active, slot };

        let max_attempts = config.max_retries().saturating_add(1);
        let mut attempt = 0u32;
        let (error, failure) = loop {
            attempt += 1;
            self.track(slot, |ctx| ctx.attempt = attempt);

            let outcome = match config.conditions().timeout {
                Some(limit) => {
                    let start = tokio::time::Instant::now();
                    match tokio::time::timeout(limit, operation()).await {
                        Ok(outcome) => outcome.map_err(ResilienceError::Inner),
                        Err(_) => Err(ResilienceError::Timeout { elapsed: start.elapsed(), timeout: limit }),
                    }
                }
                None => operation().await.map_err(ResilienceError::Inner),
            };

            let error = match outcome {
                Ok(value) => {
                    let total_duration = self.elapsed_since(started_at);
                    self.record_success(&config);
                    tracing::debug!(
                        config_id,
                        operation_id = %operation_id,
                        attempts = attempt,
                        "operation succeeded"
                    );
                    self.listeners.emit(&RetryEvent::OperationSuccess {
                        operation_id: operation_id.clone(),
                        config_id: config_id.to_string(),
                        attempts: attempt,
                        total_duration,
                    });
                    return Ok(RetryResult {
                        result: Ok(value),
                        attempts: attempt,
                        total_duration,
                        operation_id,
                    });
                }
                Err(error) => error,
            };

            let failure = FailureRecord::from_resilience(&error);
            if attempt >= max_attempts || !config.conditions().should_retry(&failure) {
                break (error, failure);
            }

            let delay = config.calculate_delay(attempt - 1);
            tracing::debug!(
                config_id,
                operation_id = %operation_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying operation"
            );
            self.track(slot, |ctx| ctx.last_error = Some(failure.clone()));
            self.listeners.emit(&RetryEvent::OperationRetry {
                operation_id: operation_id.clone(),
                config_id: config_id.to_string(),
                attempt,
                delay,
                error: failure,
            });
            self.sleeper.sleep(delay).await;
        };

        let now = self.clock.now_millis();
        let total_duration = self.elapsed_since(started_at);
        self.record_failure(&config, now);

        if let Some(settings) = config.dead_letter() {
            let item = DeadLetterItem {
                id: self.ids.next_id(),
                operation_id: operation_id.clone(),
                config_id: config_id.to_string(),
                metadata,
                error: failure.clone(),
                attempts: attempt,
                first_attempt: started_at,
                last_attempt: now,
                next_retry: now.saturating_add(millis(settings.retry_after())),
            };
            for evicted in self.dead_letters.push(item.clone(), settings.max_size()) {
                tracing::warn!(
                    config_id,
                    item_id = %evicted.id,
                    operation_id = %evicted.operation_id,
                    "dead-letter queue full, evicted oldest item"
                );
            }
            self.listeners.emit(&RetryEvent::DeadLetterAdded { item });
        }

        tracing::warn!(
            config_id,
            operation_id = %operation_id,
            attempts = attempt,
            error = %failure,
            "operation failed"
        );
        self.listeners.emit(&RetryEvent::OperationFailed {
            operation_id: operation_id.clone(),
            config_id: config_id.to_string(),
            attempts: attempt,
            total_duration,
            error: failure,
        });

        Ok(RetryResult { result: Err(error), attempts: attempt, total_duration, operation_id })
    }

    /// Advance the breaker for `config`; `Some((failure_count, retry_in))` when open.
    fn admit(&self, config: &RetryConfig, now: u64) -> Option<(u32, Duration)> {
        let settings = config.circuit_breaker()?;
        let (transition, open) = {
            let mut breakers = self.lock_breakers();
            let state = breakers
                .entry(config.id().to_string())
                .or_insert_with(|| CircuitBreakerState::new(now));
            let transition = state.check(settings, now);
            let open = state.is_open().then(|| (state.failure_count, state.retry_in(now)));
            (transition, open)
        };
        self.announce(config.id(), transition);
        open
    }

    fn record_success(&self, config: &RetryConfig) {
        if config.circuit_breaker().is_none() {
            return;
        }
        let now = self.clock.now_millis();
        let transition = self
            .lock_breakers()
            .get_mut(config.id())
            .and_then(|state| state.record_success(now));
        self.announce(config.id(), transition);
    }

    fn record_failure(&self, config: &RetryConfig, now: u64) {
        let Some(settings) = config.circuit_breaker() else {
            return;
        };
        let transition = self
            .lock_breakers()
            .get_mut(config.id())
            .and_then(|state| state.record_failure(settings, now));
        self.announce(config.id(), transition);
    }

    fn announce(&self, config_id: &str, transition: Option<Transition>) {
        let event = match transition {
            None => return,
            Some(Transition::Opened { failure_count, reset_at }) => {
                tracing::error!(config_id, failure_count, reset_at, "circuit breaker opened");
                RetryEvent::CircuitBreakerOpen {
                    config_id: config_id.to_string(),
                    failure_count,
                    reset_at,
                }
            }
            Some(Transition::HalfOpened) => {
                tracing::info!(config_id, "circuit breaker half-open");
                RetryEvent::CircuitBreakerHalfOpen { config_id: config_id.to_string() }
            }
            Some(Transition::Closed) => {
                tracing::info!(config_id, "circuit breaker closed");
                RetryEvent::CircuitBreakerClosed { config_id: config_id.to_string() }
            }
        };
        self.listeners.emit(&event);
    }

    /// Snapshot of the breaker of `config_id`, if it has one.
    pub fn circuit_breaker_state(&self, config_id: &str) -> Option<CircuitBreakerState> {
        self.lock_breakers().get(config_id).cloned()
    }

    /// Force the breaker of `config_id` closed with zeroed counters.
    pub fn reset_circuit_breaker(&self, config_id: &str) -> bool {
        let now = self.clock.now_millis();
        let found = match self.lock_breakers().get_mut(config_id) {
            Some(state) => {
                state.reset(now);
                true
            }
            None => false,
        };
        if found {
            tracing::info!(config_id, "circuit breaker reset");
            self.listeners.emit(&RetryEvent::CircuitBreakerReset { config_id: config_id.to_string() });
        }
        found
    }

    /// Counters for one config, or for the whole handler.
    pub fn get_stats(&self, config_id: Option<&str>) -> RetryStats {
        let mut active_operation_ids: Vec<String> = self
            .lock_active()
            .values()
            .filter(|ctx| config_id.map_or(true, |id| ctx.config_id == id))
            .map(|ctx| ctx.operation_id.clone())
            .collect();
        active_operation_ids.sort();

        let open_circuit_breakers = self
            .lock_breakers()
            .iter()
            .filter(|(id, state)| config_id.map_or(true, |wanted| id.as_str() == wanted) && state.is_open())
            .count();

        RetryStats {
            total_configs: match config_id {
                Some(id) => usize::from(self.configs.contains(id)),
                None => self.configs.len(),
            },
            active_operations: active_operation_ids.len(),
            open_circuit_breakers,
            dead_letter_queue_size: self.dead_letters.len(config_id),
            active_operation_ids,
        }
    }

    /// Operations currently inside `execute`.
    pub fn active_operations(&self) -> Vec<RetryContext> {
        let mut ops: Vec<RetryContext> = self.lock_active().values().cloned().collect();
        ops.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.operation_id.cmp(&b.operation_id)));
        ops
    }

    /// Dead-letter items of one config, or of every config.
    pub fn dead_letter_items(&self, config_id: Option<&str>) -> Vec<DeadLetterItem> {
        self.dead_letters.items(config_id)
    }

    /// Drop one item, typically after the host replayed it successfully.
    pub fn remove_dead_letter(&self, item_id: &str) -> Option<DeadLetterItem> {
        self.dead_letters.remove(item_id)
    }

    pub fn clear_dead_letters(&self, config_id: Option<&str>) -> usize {
        let cleared = self.dead_letters.clear(config_id);
        tracing::debug!(config_id, cleared, "dead-letter items cleared");
        cleared
    }

    /// Remove every due dead-letter item and hand it back for replay.
    ///
    /// Emits `DeadLetterProcessing` when the queue is non-empty, then one
    /// `DeadLetterRetryNeeded` per returned item.
    pub fn process_dead_letters(&self) -> Vec<DeadLetterItem> {
        let (pending, due) = self.dead_letters.take_due(self.clock.now_millis());
        if pending == 0 {
            return due;
        }
        tracing::debug!(pending, due = due.len(), "processing dead-letter queue");
        self.listeners.emit(&RetryEvent::DeadLetterProcessing { pending, due: due.len() });
        for item in &due {
            self.listeners.emit(&RetryEvent::DeadLetterRetryNeeded { item: item.clone() });
        }
        due
    }

    /// Stop tracking operations running longer than `options.stale_after`.
    ///
    /// The operations themselves keep running; only the bookkeeping is dropped. Returns the
    /// ids that were dropped.
    pub fn cleanup_stale_operations(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let threshold = millis(self.options.stale_after);
        let stale: Vec<RetryContext> = {
            let mut active = self.lock_active();
            let slots: Vec<u64> = active
                .iter()
                .filter(|(_, ctx)| now.saturating_sub(ctx.started_at) > threshold)
                .map(|(slot, _)| *slot)
                .collect();
            slots.iter().filter_map(|slot| active.remove(slot)).collect()
        };

        stale
            .into_iter()
            .map(|ctx| {
                let running_for = Duration::from_millis(now.saturating_sub(ctx.started_at));
                tracing::warn!(
                    config_id = %ctx.config_id,
                    operation_id = %ctx.operation_id,
                    running_for_secs = running_for.as_secs(),
                    "stale operation dropped from tracking"
                );
                self.listeners.emit(&RetryEvent::OperationStaleCleanup {
                    operation_id: ctx.operation_id.clone(),
                    config_id: ctx.config_id,
                    running_for,
                });
                ctx.operation_id
            })
            .collect()
    }

    /// Drive [`process_dead_letters`](Self::process_dead_letters) and
    /// [`cleanup_stale_operations`](Self::cleanup_stale_operations) on their intervals.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        MaintenanceHandle::new(vec![
            spawn_periodic(
                "dead_letter",
                Arc::downgrade(self),
                self.options.dead_letter_interval,
                |handler: &RetryHandler| {
                    handler.process_dead_letters();
                },
            ),
            spawn_periodic(
                "stale_operations",
                Arc::downgrade(self),
                self.options.stale_sweep_interval,
                |handler: &RetryHandler| {
                    handler.cleanup_stale_operations();
                },
            ),
        ])
    }

    pub fn subscribe<S>(&self, sink: S) -> SubscriptionId
    where
        S: EventSink<RetryEvent> + 'static,
    {
        self.listeners.subscribe(sink)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn track(&self, slot: u64, update: impl FnOnce(&mut RetryContext)) {
        if let Some(ctx) = self.lock_active().get_mut(&slot) {
            update(ctx);
        }
    }

    fn elapsed_since(&self, start: u64) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(start))
    }

    fn lock_breakers(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<u64, RetryContext>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandler")
            .field("configs", &self.configs.len())
            .field("active_operations", &self.lock_active().len())
            .field("dead_letters", &self.dead_letters.len(None))
            .field("options", &self.options)
            .finish()
    }
}

/// Builder for [`RetryHandler`] with injectable clock, sleeper and id generator.
#[derive(Default)]
pub struct RetryHandlerBuilder {
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    ids: Option<Arc<dyn IdGenerator>>,
    options: RetryHandlerOptions,
}

impl RetryHandlerBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    pub fn ids(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    pub fn options(mut self, options: RetryHandlerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> RetryHandler {
        RetryHandler {
            configs: ConfigRegistry::new(),
            breakers: Mutex::new(HashMap::new()),
            dead_letters: DeadLetterQueue::new(),
            active: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(0),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            listeners: Listeners::new(),
            options: self.options,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryStrategy;
    use crate::clock::ManualClock;
    use crate::ids::SequentialIds;
    use crate::retry::OperationError;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use crate::telemetry::MemorySink;
    use crate::CircuitBreakerSettings;

    fn handler(clock: &ManualClock) -> RetryHandler {
        RetryHandler::builder()
            .clock(clock.clone())
            .sleeper(InstantSleeper)
            .ids(SequentialIds::new("op"))
            .build()
    }

    fn fixed(id: &str) -> RetryConfigSpec {
        RetryConfigSpec::new(RetryStrategy::Fixed).id(id).initial_delay(Duration::from_millis(10))
    }

    fn failing() -> impl Future<Output = Result<(), OperationError>> {
        async { Err(OperationError::new("NetworkError", "connection reset")) }
    }

    #[tokio::test]
    async fn retry_delays_follow_strategy() {
        let sleeper = TrackingSleeper::new();
        let h = RetryHandler::builder().sleeper(sleeper.clone()).build();
        h.add_config(
            RetryConfigSpec::new(RetryStrategy::Exponential)
                .id("exp")
                .max_retries(3)
                .initial_delay(Duration::from_millis(100)),
        )
        .unwrap();
        let result = h.execute("exp", failing).await.unwrap();
        assert_eq!(result.attempts, 4);
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[tokio::test]
    async fn breaker_created_and_destroyed_with_config() {
        let h = handler(&ManualClock::new(0));
        let settings =
            CircuitBreakerSettings::new(2, Duration::from_secs(5), Duration::from_secs(60)).unwrap();
        h.add_config(fixed("cb").circuit_breaker(settings)).unwrap();
        assert!(h.circuit_breaker_state("cb").is_some());

        h.update_config("cb", RetryConfigUpdate::new().circuit_breaker(None)).unwrap();
        assert!(h.circuit_breaker_state("cb").is_none());
        h.update_config("cb", RetryConfigUpdate::new().circuit_breaker(Some(settings))).unwrap();
        assert!(h.circuit_breaker_state("cb").is_some());

        assert!(h.remove_config("cb"));
        assert!(h.circuit_breaker_state("cb").is_none());
        assert!(!h.remove_config("cb"));
    }

    #[tokio::test]
    async fn reset_circuit_breaker_emits_event() {
        let clock = ManualClock::new(0);
        let h = handler(&clock);
        let sink = MemorySink::new();
        h.subscribe(sink.clone());
        let settings =
            CircuitBreakerSettings::new(1, Duration::from_secs(5), Duration::from_secs(60)).unwrap();
        h.add_config(fixed("cb").max_retries(0).circuit_breaker(settings)).unwrap();

        h.execute("cb", failing).await.unwrap();
        assert!(h.circuit_breaker_state("cb").unwrap().is_open());
        assert_eq!(h.get_stats(None).open_circuit_breakers, 1);

        assert!(h.reset_circuit_breaker("cb"));
        assert!(!h.reset_circuit_breaker("missing"));
        assert!(!h.circuit_breaker_state("cb").unwrap().is_open());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, RetryEvent::CircuitBreakerReset { config_id } if config_id == "cb")));
    }

    #[tokio::test]
    async fn active_operations_are_tracked_while_running() {
        let h = Arc::new(handler(&ManualClock::new(0)));
        h.add_config(fixed("slow")).unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release = Arc::new(Mutex::new(Some(release_rx)));

        let task = {
            let h = h.clone();
            tokio::spawn(async move {
                h.execute_with("slow", ExecuteOptions::new().operation_id("job-1"), || {
                    let rx = release.lock().unwrap().take();
                    async move {
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok::<_, OperationError>(())
                    }
                })
                .await
            })
        };

        while h.get_stats(None).active_operations == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.get_stats(Some("slow")).active_operation_ids, vec!["job-1"]);
        assert_eq!(h.active_operations()[0].attempt, 1);

        release_tx.send(()).unwrap();
        let result = task.await.unwrap().unwrap();
        assert!(result.is_success());
        assert_eq!(h.get_stats(None).active_operations, 0);
    }

    #[tokio::test]
    async fn stale_operations_are_dropped_from_tracking() {
        let clock = ManualClock::new(0);
        let h = Arc::new(handler(&clock));
        let sink = MemorySink::new();
        h.subscribe(sink.clone());
        h.add_config(fixed("hang")).unwrap();

        let task = {
            let h = h.clone();
            tokio::spawn(async move {
                h.execute_with("hang", ExecuteOptions::new().operation_id("stuck"), || {
                    futures::future::pending::<Result<(), OperationError>>()
                })
                .await
            })
        };
        while h.get_stats(None).active_operations == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance(30 * 60 * 1000);
        assert!(h.cleanup_stale_operations().is_empty());
        clock.advance(31 * 60 * 1000);
        assert_eq!(h.cleanup_stale_operations(), vec!["stuck".to_string()]);
        assert_eq!(h.get_stats(None).active_operations, 0);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, RetryEvent::OperationStaleCleanup { operation_id, .. } if operation_id == "stuck")));
        task.abort();
    }

    #[tokio::test]
    async fn repeated_operation_ids_are_tracked_separately() {
        let h = Arc::new(handler(&ManualClock::new(0)));
        h.add_config(fixed("dup")).unwrap();
        let (fast_tx, fast_rx) = tokio::sync::oneshot::channel::<()>();
        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();

        let spawn_waiting = |rx: tokio::sync::oneshot::Receiver<()>| {
            let h = h.clone();
            let rx = Arc::new(Mutex::new(Some(rx)));
            tokio::spawn(async move {
                h.execute_with("dup", ExecuteOptions::new().operation_id("dup"), || {
                    let rx = rx.lock().unwrap().take();
                    async move {
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok::<_, OperationError>(())
                    }
                })
                .await
            })
        };
        let fast = spawn_waiting(fast_rx);
        let slow = spawn_waiting(slow_rx);

        while h.get_stats(None).active_operations < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.get_stats(None).active_operation_ids, vec!["dup", "dup"]);

        fast_tx.send(()).unwrap();
        assert!(fast.await.unwrap().unwrap().is_success());
        assert_eq!(h.get_stats(None).active_operations, 1);
        assert_eq!(h.active_operations()[0].operation_id, "dup");

        slow_tx.send(()).unwrap();
        assert!(slow.await.unwrap().unwrap().is_success());
        assert_eq!(h.get_stats(None).active_operations, 0);
    }
}
