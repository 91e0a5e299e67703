//! Suppression of a publisher's own broker echoes.

use std::{
    collections::HashSet,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

/// Process-local set of ids recently published by this node. Ids are inserted
/// before publish and removed on first consumption, so the subscriber loop
/// can tell "our own message coming back" from everyone else's.
pub struct IgnoreSet {
    counter: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IgnoreSet {
    /// The counter starts at a random u32 so different instances are very
    /// unlikely to collide, while leaving the full u64 range to grow into.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(u64::from(rand::random::<u32>())),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a fresh id and mark it as ours.
    pub fn next(&self) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        id
    }

    /// True exactly once per id handed out by [`IgnoreSet::next`].
    pub fn consume(&self, id: u64) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_is_once() {
        let set = IgnoreSet::new();
        let id = set.next();
        assert!(set.consume(id));
        assert!(!set.consume(id));
    }

    #[test]
    fn test_unknown_id_not_consumed() {
        let set = IgnoreSet::new();
        set.next();
        assert!(!set.consume(0));
    }

    #[test]
    fn test_ids_are_unique() {
        let set = IgnoreSet::new();
        let a = set.next();
        let b = set.next();
        assert_ne!(a, b);
        assert!(set.consume(a));
        assert!(set.consume(b));
    }
}
