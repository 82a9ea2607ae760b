//! Lifecycle events and the sinks that consume them.
//!
//! Both components publish a typed event stream instead of a string-keyed emitter:
//!
//! - **RateLimiter**: [`RateLimitEvent`] (config changes, threshold and limit breaches,
//!   state cleanup)
//! - **RetryHandler**: [`RetryEvent`] (config changes, operation outcomes, circuit
//!   transitions, dead-letter activity)
//!
//! Consumers register an [`EventSink`] with the component's `subscribe` method. Closures
//! taking `&Event` are sinks, and [`LogSink`], [`MemorySink`], [`ChannelSink`] and
//! [`NullSink`] cover the common cases.

pub mod events;
pub mod sinks;

pub use events::{RateLimitEvent, RetryEvent};
pub use sinks::{ChannelSink, EventSink, Listeners, LogSink, MemorySink, NullSink, SubscriptionId};
