use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tower_layer::Layer;
use tower_service::Service;

use super::{RateLimitContext, RateLimiter, ViolationAction};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::ResilienceError;

/// Tower layer that runs every request through a shared [`RateLimiter`].
///
/// `extract` builds the [`RateLimitContext`] from the request. Directives are enacted as
/// follows: a blocking denial fails the call with [`ResilienceError::RateLimited`], a
/// `delay` denial holds the request for the longest configured delay, and `throttle`
/// denials pass through untouched.
pub struct RateLimitLayer<F> {
    limiter: Arc<RateLimiter>,
    extract: Arc<F>,
    config_id: Option<String>,
    sleeper: Arc<dyn Sleeper>,
}

impl<F> RateLimitLayer<F> {
    pub fn new(limiter: Arc<RateLimiter>, extract: F) -> Self {
        Self { limiter, extract: Arc::new(extract), config_id: None, sleeper: Arc::new(TokioSleeper) }
    }

    /// Check only this config instead of every applicable one.
    pub fn for_config(mut self, config_id: impl Into<String>) -> Self {
        self.config_id = Some(config_id.into());
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }
}

impl<F> Clone for RateLimitLayer<F> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
            config_id: self.config_id.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<F> fmt::Debug for RateLimitLayer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("config_id", &self.config_id).finish_non_exhaustive()
    }
}

impl<S, F> Layer<S> for RateLimitLayer<F> {
    type Service = RateLimitService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, layer: self.clone() }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
pub struct RateLimitService<S, F> {
    inner: S,
    layer: RateLimitLayer<F>,
}

impl<S: Clone, F> Clone for RateLimitService<S, F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for RateLimitService<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("layer", &self.layer)
            .finish()
    }
}

impl<S, F, Req> Service<Req> for RateLimitService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    F: Fn(&Req) -> RateLimitContext + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // The clone may not be ready; keep the instance that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let ctx = (self.layer.extract)(&req);
        let verdict = self.layer.limiter.check_limit(&ctx, self.layer.config_id.as_deref());
        let sleeper = self.layer.sleeper.clone();

        async move {
            let results = match verdict {
                Ok(results) => results,
                Err(err) => return Err(ResilienceError::Config(err)),
            };

            if let Some(blocked) = results.iter().find(|r| r.is_blocking()) {
                return Err(ResilienceError::RateLimited {
                    config_id: blocked.config.id().to_string(),
                    retry_after: blocked.retry_after,
                });
            }

            let delay = results
                .iter()
                .filter(|r| !r.allowed)
                .filter_map(|r| match r.action {
                    ViolationAction::Delay { delay } => Some(delay),
                    _ => None,
                })
                .max()
                .unwrap_or(Duration::ZERO);
            if !delay.is_zero() {
                tracing::debug!(delay_ms = delay.as_millis() as u64, "delaying rate-limited request");
                sleeper.sleep(delay).await;
            }

            inner.call(req).await.map_err(ResilienceError::Inner)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::{Algorithm, Limits, RateLimitConfigSpec};
    use crate::sleeper::TrackingSleeper;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    fn extract(path: &&'static str) -> RateLimitContext {
        RateLimitContext::new("192.0.2.1", "GET", *path)
    }

    async fn upper(req: &'static str) -> Result<String, Infallible> {
        Ok(req.to_uppercase())
    }

    #[tokio::test]
    async fn blocking_denial_becomes_rate_limited_error() {
        let limiter = Arc::new(RateLimiter::builder().clock(ManualClock::new(0)).build());
        limiter
            .add_config(RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(1, 60)).id("edge"))
            .unwrap();
        let layer = RateLimitLayer::new(limiter, extract);

        let ok = layer.layer(service_fn(upper)).oneshot("/a").await.unwrap();
        assert_eq!(ok, "/A");

        let err = layer.layer(service_fn(upper)).oneshot("/a").await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(matches!(err, ResilienceError::RateLimited { ref config_id, .. } if config_id == "edge"));
    }

    #[tokio::test]
    async fn delay_denial_sleeps_then_passes() {
        let limiter = Arc::new(RateLimiter::builder().clock(ManualClock::new(0)).build());
        limiter
            .add_config(
                RateLimitConfigSpec::new(Algorithm::FixedWindow, Limits::new(1, 60))
                    .action(ViolationAction::Delay { delay: Duration::from_millis(250) }),
            )
            .unwrap();
        let sleeper = TrackingSleeper::new();
        let layer = RateLimitLayer::new(limiter, extract).with_sleeper(sleeper.clone());

        layer.layer(service_fn(upper)).oneshot("/b").await.unwrap();
        assert!(sleeper.calls().is_empty());
        let res = layer.layer(service_fn(upper)).oneshot("/b").await.unwrap();
        assert_eq!(res, "/B");
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(250)]);
    }

    #[tokio::test]
    async fn unknown_config_is_a_config_error() {
        let limiter = Arc::new(RateLimiter::builder().clock(ManualClock::new(0)).build());
        let layer = RateLimitLayer::new(limiter, extract).for_config("ghost");
        let err = layer.layer(service_fn(upper)).oneshot("/c").await.unwrap_err();
        assert!(matches!(err, ResilienceError::Config(_)));
    }
}
