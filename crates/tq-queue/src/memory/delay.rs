//! Timer wheel for TTL expiry, ordered by deadline then insertion

use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::graph::Expiry;

struct Scheduled {
    seq: u64,
    expiry: Expiry,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.expiry.at, self.seq).cmp(&(other.expiry.at, other.seq))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
}

pub(crate) struct DelayQueue {
    heap: Mutex<Heap>,
    /// Wakes the expiry driver when an earlier deadline may have been added
    notify: Arc<Notify>,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn schedule(&self, expiries: Vec<Expiry>) {
        if expiries.is_empty() {
            return;
        }

        {
            let mut heap = self.heap.lock();
            for expiry in expiries {
                let seq = heap.next_seq;
                heap.next_seq += 1;
                heap.entries.push(Reverse(Scheduled { seq, expiry }));
            }
        }
        self.notify.notify_one();
    }

    /// Remove and return everything due at `now`, earliest first
    pub fn pop_due(&self, now: Instant) -> Vec<Expiry> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap.entries.peek().is_some_and(|Reverse(s)| s.expiry.at <= now) {
            if let Some(Reverse(scheduled)) = heap.entries.pop() {
                due.push(scheduled.expiry);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().entries.peek().map(|Reverse(s)| s.expiry.at)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::graph::Routed;
    use std::time::Duration;
    use tq_common::Envelope;

    fn expiry(at: Instant, body: &str) -> Expiry {
        Expiry {
            at,
            queue: "waiting".to_string(),
            routed: Routed {
                exchange: "incoming".to_string(),
                envelope: Envelope::new(body, "alive"),
            },
        }
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let queue = DelayQueue::new();
        let now = Instant::now();

        queue.schedule(vec![
            expiry(now + Duration::from_secs(3), "c"),
            expiry(now + Duration::from_secs(1), "a"),
            expiry(now + Duration::from_secs(1), "b"),
        ]);

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(queue.pop_due(now).is_empty());

        let due = queue.pop_due(now + Duration::from_secs(2));
        let bodies: Vec<&[u8]> = due.iter().map(|e| e.routed.envelope.body.as_slice()).collect();
        assert_eq!(bodies, vec![b"a".as_slice(), b"b".as_slice()]);
        assert_eq!(queue.len(), 1);
    }
}
