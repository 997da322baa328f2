//! Block and page id generation.
//!
//! Ids are assigned by an injected generator so that tests and snapshot
//! tooling can produce stable, predictable ids while production workspaces
//! use random UUIDs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of globally unique ids for pages and blocks.
pub trait IdGenerator: Send + Sync {
    /// Produce the next id. Ids are never reused within a workspace.
    fn next_id(&self) -> String;
}

/// Random v4 UUID generator, the production default.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Monotonic counter generator producing `"0"`, `"1"`, ... for
/// deterministic tests.
#[derive(Debug, Default)]
pub struct AutoIncrementGenerator {
    next: AtomicU64,
}

impl AutoIncrementGenerator {
    /// Create a generator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for AutoIncrementGenerator {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_ids_are_unique() {
        let generator = UuidGenerator;
        assert_ne!(generator.next_id(), generator.next_id());
    }

    #[test]
    fn test_auto_increment_sequence() {
        let generator = AutoIncrementGenerator::new();
        assert_eq!(generator.next_id(), "0");
        assert_eq!(generator.next_id(), "1");
        assert_eq!(generator.next_id(), "2");
    }
}
