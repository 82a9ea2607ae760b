//! The four admission algorithms.
//!
//! Each is a pure function of `(limits, state, now)` that mutates the state in place.
//! Callers serialize access per key (see [`StateStore`](super::StateStore)); nothing
//! here locks.

use std::time::Duration;

use super::{Algorithm, Limits, RateLimitState};

/// Outcome of one algorithm step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub allowed: bool,
    pub remaining: u64,
    /// Clock time (ms) at which quota is restored
    pub reset_at: u64,
    /// Set only when denied
    pub retry_after: Option<Duration>,
}

/// Admit or deny one request against `state`, updating it.
pub fn evaluate(
    algorithm: Algorithm,
    limits: &Limits,
    state: &mut RateLimitState,
    now: u64,
) -> Evaluation {
    let eval = match algorithm {
        Algorithm::TokenBucket => token_bucket(limits, state, now),
        Algorithm::SlidingWindow => sliding_window(limits, state, now),
        Algorithm::FixedWindow => fixed_window(limits, state, now),
        Algorithm::LeakyBucket => leaky_bucket(limits, state, now),
    };
    state.updated_at = now;
    eval
}

fn elapsed_secs(since: u64, now: u64) -> f64 {
    now.saturating_sub(since) as f64 / 1000.0
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0).ceil() as u64
}

fn ceil_secs(secs: f64) -> Duration {
    Duration::from_secs(secs.max(0.0).ceil() as u64)
}

fn token_bucket(limits: &Limits, state: &mut RateLimitState, now: u64) -> Evaluation {
    let capacity = limits.capacity() as f64;
    let rate = limits.rate_per_sec();

    state.tokens = (state.tokens + elapsed_secs(state.last_refill, now) * rate).min(capacity);
    state.last_refill = now;

    let allowed = state.tokens >= 1.0;
    if allowed {
        state.tokens -= 1.0;
    }
    Evaluation {
        allowed,
        remaining: state.tokens.floor() as u64,
        reset_at: now.saturating_add(secs_to_ms((capacity - state.tokens) / rate)),
        retry_after: (!allowed).then(|| ceil_secs((1.0 - state.tokens) / rate)),
    }
}

fn sliding_window(limits: &Limits, state: &mut RateLimitState, now: u64) -> Evaluation {
    let window = limits.window_ms();
    while let Some(&oldest) = state.timestamps.front() {
        if now.saturating_sub(oldest) < window {
            break;
        }
        state.timestamps.pop_front();
    }

    let allowed = (state.timestamps.len() as u64) < limits.requests;
    if allowed {
        state.timestamps.push_back(now);
    }
    state.count = state.timestamps.len() as u64;

    let reset_at = state.timestamps.front().map_or(now, |&oldest| oldest.saturating_add(window));
    Evaluation {
        allowed,
        remaining: limits.requests.saturating_sub(state.count),
        reset_at,
        retry_after: (!allowed)
            .then(|| ceil_secs(reset_at.saturating_sub(now) as f64 / 1000.0)),
    }
}

fn fixed_window(limits: &Limits, state: &mut RateLimitState, now: u64) -> Evaluation {
    let window = limits.window_ms();
    let start = now - now % window;
    if start != state.window_start {
        state.window_start = start;
        state.window_end = start.saturating_add(window);
        state.count = 0;
    }

    let allowed = state.count < limits.requests;
    if allowed {
        state.count += 1;
    }
    Evaluation {
        allowed,
        remaining: limits.requests.saturating_sub(state.count),
        reset_at: state.window_end,
        retry_after: (!allowed)
            .then(|| ceil_secs(state.window_end.saturating_sub(now) as f64 / 1000.0)),
    }
}

fn leaky_bucket(limits: &Limits, state: &mut RateLimitState, now: u64) -> Evaluation {
    let capacity = limits.capacity() as f64;
    let rate = limits.rate_per_sec();

    state.level = (state.level - elapsed_secs(state.last_refill, now) * rate).max(0.0);
    state.last_refill = now;

    let allowed = state.level < capacity;
    if allowed {
        state.level += 1.0;
    }
    Evaluation {
        allowed,
        remaining: (capacity - state.level).max(0.0).floor() as u64,
        reset_at: now.saturating_add(secs_to_ms(state.level / rate)),
        retry_after: (!allowed).then(|| ceil_secs((state.level - capacity + 1.0) / rate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(algorithm: Algorithm, limits: Limits, times: &[u64]) -> (Vec<bool>, RateLimitState) {
        let mut state = RateLimitState::new(algorithm, &limits, times[0]);
        let verdicts =
            times.iter().map(|&t| evaluate(algorithm, &limits, &mut state, t).allowed).collect();
        (verdicts, state)
    }

    #[test]
    fn token_bucket_spends_then_refills() {
        let limits = Limits::new(10, 10).with_burst(10);
        let mut state = RateLimitState::new(Algorithm::TokenBucket, &limits, 0);
        for i in 0..10 {
            let eval = evaluate(Algorithm::TokenBucket, &limits, &mut state, 0);
            assert!(eval.allowed, "request {} should pass", i);
            assert_eq!(eval.remaining, 9 - i);
        }
        let denied = evaluate(Algorithm::TokenBucket, &limits, &mut state, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(denied.reset_at, 10_000);

        assert!(evaluate(Algorithm::TokenBucket, &limits, &mut state, 1_000).allowed);
        assert!(!evaluate(Algorithm::TokenBucket, &limits, &mut state, 1_000).allowed);
    }

    #[test]
    fn token_bucket_caps_at_capacity() {
        let limits = Limits::new(10, 10).with_burst(3);
        let mut state = RateLimitState::new(Algorithm::TokenBucket, &limits, 0);
        evaluate(Algorithm::TokenBucket, &limits, &mut state, 3_600_000);
        assert!(state.tokens <= 3.0);
    }

    #[test]
    fn sliding_window_forgets_old_requests() {
        let limits = Limits::new(5, 60);
        let (verdicts, _) = run(Algorithm::SlidingWindow, limits, &[0, 0, 0, 0, 0, 0]);
        assert_eq!(verdicts, vec![true, true, true, true, true, false]);

        let mut state = RateLimitState::new(Algorithm::SlidingWindow, &limits, 0);
        for _ in 0..5 {
            evaluate(Algorithm::SlidingWindow, &limits, &mut state, 0);
        }
        let denied = evaluate(Algorithm::SlidingWindow, &limits, &mut state, 30_000);
        assert_eq!(denied.reset_at, 60_000);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));

        let eval = evaluate(Algorithm::SlidingWindow, &limits, &mut state, 61_000);
        assert!(eval.allowed);
        assert_eq!(state.timestamps, [61_000]);
        assert_eq!(eval.remaining, 4);
    }

    #[test]
    fn fixed_window_aligns_to_boundaries() {
        let limits = Limits::new(3, 10);
        let (verdicts, state) =
            run(Algorithm::FixedWindow, limits, &[3_000, 4_000, 5_000, 6_000, 10_000]);
        assert_eq!(verdicts, vec![true, true, true, false, true]);
        assert_eq!(state.window_start, 10_000);
        assert_eq!(state.count, 1);
    }

    #[test]
    fn fixed_window_reports_window_end() {
        let limits = Limits::new(1, 10);
        let mut state = RateLimitState::new(Algorithm::FixedWindow, &limits, 2_500);
        evaluate(Algorithm::FixedWindow, &limits, &mut state, 2_500);
        let denied = evaluate(Algorithm::FixedWindow, &limits, &mut state, 2_500);
        assert_eq!(denied.reset_at, 10_000);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(8)));
    }

    #[test]
    fn leaky_bucket_drains_one_slot_per_leak_interval() {
        let limits = Limits::new(2, 2);
        let mut state = RateLimitState::new(Algorithm::LeakyBucket, &limits, 0);
        assert!(evaluate(Algorithm::LeakyBucket, &limits, &mut state, 0).allowed);
        assert!(evaluate(Algorithm::LeakyBucket, &limits, &mut state, 0).allowed);
        let denied = evaluate(Algorithm::LeakyBucket, &limits, &mut state, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(denied.reset_at, 2_000);

        assert!(evaluate(Algorithm::LeakyBucket, &limits, &mut state, 1_000).allowed);
        assert!(!evaluate(Algorithm::LeakyBucket, &limits, &mut state, 1_000).allowed);
    }

    #[test]
    fn evaluate_touches_updated_at() {
        let limits = Limits::new(1, 1);
        let mut state = RateLimitState::new(Algorithm::FixedWindow, &limits, 0);
        evaluate(Algorithm::FixedWindow, &limits, &mut state, 777);
        assert_eq!(state.updated_at, 777);
    }
}
