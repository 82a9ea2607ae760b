//! Identifier generation for configs, operations and dead-letter items.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of unique string identifiers.
pub trait IdGenerator: Send + Sync + std::fmt::Debug {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. The default generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Sequential ids (`prefix-1`, `prefix-2`, ...) for deterministic tests.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), next: AtomicU64::new(1) }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new("id")
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialIds::new("op");
        assert_eq!(ids.next_id(), "op-1");
        assert_eq!(ids.next_id(), "op-2");
    }

    #[test]
    fn uuids_are_unique() {
        let gen = UuidGenerator;
        assert_ne!(gen.next_id(), gen.next_id());
    }
}
