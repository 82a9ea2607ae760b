//! Dead-letter queue for operations that exhausted their retries.
//!
//! Bounded per config: when a config's queue is full, the item with the oldest
//! `first_attempt` is evicted to make room. Items become due at `next_retry`; the handler's
//! sweep removes due items and hands them back to the host, which alone knows how to
//! replay the operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::FailureRecord;

/// Dead-letter settings of a retry config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeadLetterSettings {
    max_size: usize,
    retry_after: Duration,
}

impl DeadLetterSettings {
    /// `max_size` must be at least 1.
    pub fn new(max_size: usize, retry_after: Duration) -> Result<Self, ConfigError> {
        let settings = Self { max_size, retry_after };
        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::InvalidDeadLetter {
                reason: "max_size must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Items kept per config.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Delay after the last attempt before an item is due for replay.
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }
}

/// A permanently failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeadLetterItem {
    pub id: String,
    pub operation_id: String,
    pub config_id: String,
    /// Caller-supplied payload needed to replay the operation
    pub metadata: BTreeMap<String, String>,
    /// The terminal failure
    pub error: FailureRecord,
    pub attempts: u32,
    pub first_attempt: u64,
    pub last_attempt: u64,
    /// Clock time at which the item is handed back for replay
    pub next_retry: u64,
}

impl DeadLetterItem {
    pub fn is_due(&self, now: u64) -> bool {
        self.next_retry <= now
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeadLetterQueue {
    queues: Mutex<HashMap<String, VecDeque<DeadLetterItem>>>,
}

impl DeadLetterQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `item`, first evicting the oldest items of its config until there is room.
    /// Returns what was evicted.
    pub(crate) fn push(&self, item: DeadLetterItem, max_size: usize) -> Vec<DeadLetterItem> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(item.config_id.clone()).or_default();
        let mut evicted = Vec::new();
        while !queue.is_empty() && queue.len() >= max_size.max(1) {
            let oldest = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, existing)| existing.first_attempt)
                .map(|(idx, _)| idx);
            match oldest.and_then(|idx| queue.remove(idx)) {
                Some(item) => evicted.push(item),
                None => break,
            }
        }
        queue.push_back(item);
        evicted
    }

    /// Items of one config, or of all configs ordered by config id, oldest first.
    pub(crate) fn items(&self, config_id: Option<&str>) -> Vec<DeadLetterItem> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        match config_id {
            Some(id) => queues.get(id).map(|q| q.iter().cloned().collect()).unwrap_or_default(),
            None => {
                let mut ids: Vec<&String> = queues.keys().collect();
                ids.sort();
                ids.into_iter().flat_map(|id| queues[id].iter().cloned()).collect()
            }
        }
    }

    pub(crate) fn len(&self, config_id: Option<&str>) -> usize {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        match config_id {
            Some(id) => queues.get(id).map_or(0, VecDeque::len),
            None => queues.values().map(VecDeque::len).sum(),
        }
    }

    pub(crate) fn remove(&self, item_id: &str) -> Option<DeadLetterItem> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.values_mut().find_map(|queue| {
            let idx = queue.iter().position(|item| item.id == item_id)?;
            queue.remove(idx)
        })
    }

    /// Drop the items of one config, or every item. Returns how many were dropped.
    pub(crate) fn clear(&self, config_id: Option<&str>) -> usize {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        match config_id {
            Some(id) => queues.remove(id).map_or(0, |q| q.len()),
            None => {
                let total = queues.values().map(VecDeque::len).sum();
                queues.clear();
                total
            }
        }
    }

    /// Remove and return every item due at `now`, together with the number of items
    /// queued before the sweep.
    pub(crate) fn take_due(&self, now: u64) -> (usize, Vec<DeadLetterItem>) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = queues.values().map(VecDeque::len).sum();
        let due_ids: Vec<(String, String)> = queues
            .iter()
            .flat_map(|(config_id, queue)| {
                queue
                    .iter()
                    .filter(move |item| item.is_due(now))
                    .map(move |item| (config_id.clone(), item.id.clone()))
            })
            .collect();

        let mut due = Vec::with_capacity(due_ids.len());
        for (config_id, item_id) in due_ids {
            if let Some(queue) = queues.get_mut(&config_id) {
                if let Some(idx) = queue.iter().position(|item| item.id == item_id) {
                    due.extend(queue.remove(idx));
                }
            }
        }
        queues.retain(|_, queue| !queue.is_empty());
        due.sort_by_key(|item| item.next_retry);
        (pending, due)
    }
}
