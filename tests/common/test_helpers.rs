#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tollgate::rate_limit::RateLimitContext;
use tollgate::{ClockSleeper, ManualClock, RateLimiter, RetryHandler, SequentialIds};
use tracing_subscriber::fmt::MakeWriter;

/// Clock origin used by the integration tests, aligned to a 60s boundary.
pub const T0: u64 = 1_700_000_040_000;

pub fn request(ip: &str) -> RateLimitContext {
    RateLimitContext::new(ip, "GET", "/v1/orders")
}

pub fn limiter(clock: &ManualClock) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::builder().clock(clock.clone()).ids(SequentialIds::new("rl")).build())
}

/// Handler whose sleeps advance `clock` instead of waiting.
pub fn handler(clock: &ManualClock) -> Arc<RetryHandler> {
    Arc::new(
        RetryHandler::builder()
            .clock(clock.clone())
            .sleeper(ClockSleeper::new(clock.clone()))
            .ids(SequentialIds::new("op"))
            .build(),
    )
}

/// Log sink for asserting on `tracing` output.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
