use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tollgate::rate_limit::{Algorithm, Limits, RateLimitConfigSpec, RateLimitContext};
use tollgate::retry::{OperationError, RetryConfigSpec};
use tollgate::{InstantSleeper, RateLimiter, RetryHandler, RetryStrategy};

// Limits high enough that every check is admitted, so each iteration runs the full
// algorithm step instead of the cheap denial path.
fn check_limit_per_algorithm(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_limit");
    for algorithm in [
        Algorithm::TokenBucket,
        Algorithm::SlidingWindow,
        Algorithm::FixedWindow,
        Algorithm::LeakyBucket,
    ] {
        let limiter = RateLimiter::default();
        limiter
            .add_config(
                RateLimitConfigSpec::new(algorithm, Limits::new(1_000_000_000, 1)).id("bench"),
            )
            .unwrap();
        let ctx = RateLimitContext::new("198.51.100.7", "GET", "/v1/orders");

        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", algorithm)), &ctx, |b, ctx| {
            b.iter(|| black_box(limiter.check_limit(black_box(ctx), Some("bench"))))
        });
    }
    group.finish();
}

fn check_limit_many_keys(c: &mut Criterion) {
    let limiter = RateLimiter::default();
    limiter
        .add_config(RateLimitConfigSpec::new(Algorithm::TokenBucket, Limits::new(1_000, 60)).id("ip"))
        .unwrap();
    let contexts: Vec<RateLimitContext> = (0..1024)
        .map(|i| RateLimitContext::new(format!("10.0.{}.{}", i / 256, i % 256), "GET", "/"))
        .collect();

    let mut i = 0usize;
    c.bench_function("check_limit_1024_keys", |b| {
        b.iter(|| {
            i = (i + 1) % contexts.len();
            black_box(limiter.check_limit(&contexts[i], None))
        })
    });
}

fn retry_execute_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let handler = RetryHandler::builder().sleeper(InstantSleeper).build();
    handler.add_config(RetryConfigSpec::new(RetryStrategy::Exponential).id("bench")).unwrap();

    c.bench_function("retry_execute_success", |b| {
        b.to_async(&rt).iter(|| async {
            let result = handler.execute("bench", || async { Ok::<_, OperationError>(1u8) }).await;
            let _ = black_box(result);
        });
    });
}

criterion_group!(benches, check_limit_per_algorithm, check_limit_many_keys, retry_execute_success);
criterion_main!(benches);
