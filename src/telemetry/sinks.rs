use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// A consumer of lifecycle events.
///
/// Sinks are called synchronously on the emitting task, after the component has released
/// its internal locks, so a sink may call back into the component. Keep them cheap; hand
/// heavy work to a [`ChannelSink`].
pub trait EventSink<E>: Send + Sync {
    fn emit(&self, event: &E);
}

impl<E, F> EventSink<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn emit(&self, event: &E) {
        self(event)
    }
}

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl<E> EventSink<E> for NullSink {
    fn emit(&self, _event: &E) {}
}

/// A sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl<E: fmt::Display> EventSink<E> for LogSink {
    fn emit(&self, event: &E) {
        tracing::info!(event = %event, "traffic_event");
    }
}

/// A sink that stores events in memory, dropping the oldest beyond `capacity`.
#[derive(Debug)]
pub struct MemorySink<E> {
    events: Arc<Mutex<Vec<E>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl<E> Clone for MemorySink<E> {
    fn clone(&self) -> Self {
        Self { events: self.events.clone(), capacity: self.capacity, evicted: self.evicted.clone() }
    }
}

impl<E: Clone> MemorySink<E> {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl<E: Clone> Default for MemorySink<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send> EventSink<E> for MemorySink<E> {
    fn emit(&self, event: &E) {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event.clone());
    }
}

/// Forwards events into an unbounded tokio channel.
///
/// Once the receiver is gone, events are counted as dropped.
#[derive(Debug)]
pub struct ChannelSink<E> {
    tx: tokio::sync::mpsc::UnboundedSender<E>,
    dropped: AtomicU64,
}

impl<E> ChannelSink<E> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<E>) -> Self {
        Self { tx, dropped: AtomicU64::new(0) }
    }

    /// Create a sink together with the receiving end.
    pub fn channel() -> (Self, tokio::sync::mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<E: Clone + Send> EventSink<E> for ChannelSink<E> {
    fn emit(&self, event: &E) {
        if self.tx.send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of registered sinks.
pub struct Listeners<E> {
    sinks: RwLock<Vec<(SubscriptionId, Arc<dyn EventSink<E>>)>>,
    next_id: AtomicU64,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self { sinks: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub fn subscribe<S>(&self, sink: S) -> SubscriptionId
    where
        S: EventSink<E> + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.write().unwrap_or_else(PoisonError::into_inner).push((id, Arc::new(sink)));
        id
    }

    /// Remove a sink. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every sink in subscription order.
    ///
    /// The sink list is snapshotted first, so sinks may subscribe or unsubscribe while
    /// being called.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Arc<dyn EventSink<E>>> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in snapshot {
            sink.emit(event);
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("sinks", &self.len()).finish()
    }
}
