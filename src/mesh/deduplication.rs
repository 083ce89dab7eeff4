//! Packet deduplication with a bounded FIFO window

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

/// Default bound on remembered packet IDs
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

struct SeenInner {
    set: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
}

/// Bounded set of recently seen packet IDs. Consulted before relay and
/// before local delivery; eviction is FIFO once the bound is reached.
pub struct SeenSet {
    capacity: usize,
    inner: Mutex<SeenInner>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(SeenInner {
                set: HashSet::with_capacity(capacity.min(4096)),
                order: VecDeque::with_capacity(capacity.min(4096)),
            }),
        }
    }

    /// Record `id`; returns `true` the first time, `false` for duplicates
    pub fn check_and_insert(&self, id: [u8; 32]) -> bool {
        let mut inner = self.inner.lock();
        if !inner.set.insert(id) {
            return false;
        }
        inner.order.push_back(id);
        if inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.set.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &[u8; 32]) -> bool {
        self.inner.lock().set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.set.clear();
        inner.order.clear();
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> [u8; 32] {
        [n; 32]
    }

    #[test]
    fn first_sighting_is_new() {
        let seen = SeenSet::new(10);
        assert!(seen.check_and_insert(id(1)));
        assert!(!seen.check_and_insert(id(1)));
        assert!(seen.contains(&id(1)));
    }

    #[test]
    fn fifo_eviction_at_capacity() {
        let seen = SeenSet::new(2);
        assert!(seen.check_and_insert(id(1)));
        assert!(seen.check_and_insert(id(2)));
        assert!(seen.check_and_insert(id(3)));
        // id(1) was evicted first-in-first-out
        assert!(!seen.contains(&id(1)));
        assert!(seen.contains(&id(2)));
        assert!(seen.contains(&id(3)));
        assert_eq!(seen.len(), 2);
    }
}
