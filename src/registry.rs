//! Ordered, id-keyed config storage shared by both components.
//!
//! Configs are immutable `Arc` snapshots: readers keep whatever version they resolved,
//! updates swap in a new `Arc`. Iteration follows insertion order, which is the
//! evaluation order of the rate limiter.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ConfigError;

#[derive(Debug)]
struct Inner<C> {
    by_id: HashMap<String, Arc<C>>,
    order: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct ConfigRegistry<C> {
    inner: RwLock<Inner<C>>,
}

impl<C> ConfigRegistry<C> {
    pub(crate) fn new() -> Self {
        Self { inner: RwLock::new(Inner { by_id: HashMap::new(), order: Vec::new() }) }
    }

    pub(crate) fn insert(&self, id: String, config: C) -> Result<Arc<C>, ConfigError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.by_id.contains_key(&id) {
            return Err(ConfigError::DuplicateId { id });
        }
        let config = Arc::new(config);
        inner.by_id.insert(id.clone(), config.clone());
        inner.order.push(id);
        Ok(config)
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<C>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_id.get(id).cloned()
    }

    /// Replace the config under `id` with `f(current)`.
    ///
    /// Returns `Ok(None)` when `id` is unknown; errors from `f` leave the stored config
    /// untouched. The write lock is held while `f` runs, so concurrent updates to the same
    /// id are serialized.
    pub(crate) fn update<F>(&self, id: &str, f: F) -> Result<Option<(Arc<C>, Arc<C>)>, ConfigError>
    where
        F: FnOnce(&C) -> Result<C, ConfigError>,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = inner.by_id.get(id).cloned() else {
            return Ok(None);
        };
        let next = Arc::new(f(&current)?);
        inner.by_id.insert(id.to_string(), next.clone());
        Ok(Some((current, next)))
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<C>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.by_id.remove(id)?;
        inner.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// All configs in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<C>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.order.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_id.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_id.len()
    }
}
