//! Expiration-ordered id queue.
//!
//! Both the request-timeout and reply-PEND sweeps only ever look at the
//! soonest entry, so an ordered set of `(deadline, id)` pairs stands in for
//! the legacy insert-from-tail intrusive ring. Repositioning a refreshed
//! record is a remove + insert.

use std::collections::BTreeSet;

#[derive(Default)]
pub struct DeadlineQueue {
    entries: BTreeSet<(u64, u16)>,
}

impl DeadlineQueue {
    pub fn insert(&mut self, deadline: u64, id: u16) {
        self.entries.insert((deadline, id));
    }

    pub fn remove(&mut self, deadline: u64, id: u16) -> bool {
        self.entries.remove(&(deadline, id))
    }

    /// Absolute deadline of the soonest entry.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.first().map(|&(deadline, _)| deadline)
    }

    /// Pop the head if its deadline has passed.
    pub fn pop_expired(&mut self, now: u64) -> Option<u16> {
        let &(deadline, id) = self.entries.first()?;

        if deadline <= now {
            self.entries.remove(&(deadline, id));
            Some(id)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut q = DeadlineQueue::default();

        q.insert(300, 3);
        q.insert(100, 1);
        q.insert(200, 2);

        assert_eq!(q.next_deadline(), Some(100));
        assert_eq!(q.pop_expired(250), Some(1));
        assert_eq!(q.pop_expired(250), Some(2));
        assert_eq!(q.pop_expired(250), None);
        assert_eq!(q.next_deadline(), Some(300));
    }

    #[test]
    fn reposition_is_remove_then_insert() {
        let mut q = DeadlineQueue::default();

        q.insert(100, 1);
        q.insert(150, 2);

        assert!(q.remove(100, 1));
        q.insert(500, 1);

        assert_eq!(q.pop_expired(200), Some(2));
        assert_eq!(q.pop_expired(200), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn equal_deadlines_coexist() {
        let mut q = DeadlineQueue::default();

        q.insert(100, 1);
        q.insert(100, 2);

        assert_eq!(q.len(), 2);
        assert!(q.pop_expired(100).is_some());
        assert!(q.pop_expired(100).is_some());
        assert!(q.is_empty());
    }
}
