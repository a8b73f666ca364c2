//! Pending revocations, ordered by deadline.
//!
//! Entries are never updated in place. A refreshed grant pushes a second
//! entry; the older one becomes stale and the controller skips it by
//! comparing against the grant's current expiry.

use super::Timestamp;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::IpAddr;

/// Min-heap of `(deadline, address)`.
#[derive(Debug, Clone, Default)]
pub struct ExpiryQueue {
    heap: BinaryHeap<Reverse<(Timestamp, IpAddr)>>,
}

impl ExpiryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a revocation check for `address` at `deadline`.
    pub fn schedule(&mut self, address: IpAddr, deadline: Timestamp) {
        self.heap.push(Reverse((deadline, address)));
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<(Timestamp, IpAddr)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Pending entries, stale ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// No pending entries.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut queue = ExpiryQueue::new();
        queue.schedule(addr(3), Timestamp::from_secs(30));
        queue.schedule(addr(1), Timestamp::from_secs(10));
        queue.schedule(addr(2), Timestamp::from_secs(20));

        assert_eq!(queue.next_deadline(), Some(Timestamp::from_secs(10)));

        let due = queue.pop_due(Timestamp::from_secs(20));
        assert_eq!(
            due,
            vec![
                (Timestamp::from_secs(10), addr(1)),
                (Timestamp::from_secs(20), addr(2)),
            ]
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(Timestamp::from_secs(30)));
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let mut queue = ExpiryQueue::new();
        queue.schedule(addr(1), Timestamp::from_secs(10));
        assert!(queue.pop_due(Timestamp::from_millis(9_999)).is_empty());
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_same_address_can_have_stale_entries() {
        let mut queue = ExpiryQueue::new();
        queue.schedule(addr(1), Timestamp::from_secs(10));
        queue.schedule(addr(1), Timestamp::from_secs(40));
        assert_eq!(queue.pop_due(Timestamp::from_secs(10)).len(), 1);
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.next_deadline().is_none());
    }
}
