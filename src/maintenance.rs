//! Periodic background sweeps.
//!
//! Sweeps are ordinary methods on the components (`cleanup_expired`,
//! `process_dead_letters`, `cleanup_stale_operations`); hosts call them from their own
//! scheduler, or let [`spawn_periodic`] drive them on a tokio interval. A spawned loop
//! holds only a `Weak` reference and ends once the component is dropped.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Owns spawned sweep tasks; dropping it aborts them.
#[derive(Debug, Default)]
#[must_use = "dropping the handle stops the background sweeps"]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub(crate) fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Number of sweeps still running.
    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Abort every sweep now.
    pub fn stop(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Run `sweep` every `every` (at least 1ms) until `target` is gone. The first run
/// happens one period after spawning.
///
/// # Panics
///
/// Panics when called outside a tokio runtime.
pub(crate) fn spawn_periodic<T, F>(
    name: &'static str,
    target: Weak<T>,
    every: Duration,
    sweep: F,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                tracing::debug!(sweep = name, "owner dropped, stopping sweep");
                break;
            };
            tracing::trace!(sweep = name, "running sweep");
            sweep(&*target);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn runs_each_period_and_stops_with_owner() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = spawn_periodic(
            "count",
            Arc::downgrade(&counter),
            Duration::from_secs(10),
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(counter);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_aborts_on_drop() {
        let owner = Arc::new(AtomicUsize::new(0));
        let handle = MaintenanceHandle::new(vec![spawn_periodic(
            "noop",
            Arc::downgrade(&owner),
            Duration::from_secs(1),
            |_: &AtomicUsize| {},
        )]);
        assert_eq!(handle.running(), 1);
        handle.stop();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(owner.load(Ordering::SeqCst), 0);
    }
}
