//! Fixed-capacity queue of pending log records.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{LogChannel, LogRecord};

/// Default number of records held before the oldest is evicted.
pub const DEFAULT_CAPACITY: usize = 10_000;

struct Inner {
    records: VecDeque<(u64, LogRecord)>,
    next_seq: u64,
    dropped: u64,
}

/// Oldest pending record together with its queue sequence number.
#[derive(Debug, Clone)]
pub struct Pending {
    pub seq: u64,
    pub record: LogRecord,
}

/// Ring buffer of pending records with overwrite-and-count-drops semantics.
///
/// Producers never block: when the queue is full the oldest record is
/// evicted and the drop counter grows. A single sender drains it with
/// [`peek`](Self::peek) + [`pop_delivered`](Self::pop_delivered) so a record
/// is only removed once its delivery has been confirmed.
pub struct BoundedLogQueue {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for BoundedLogQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BoundedLogQueue {
    /// Create a queue holding at most `capacity` records (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 0,
                dropped: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a record, evicting the oldest one if the queue is full.
    ///
    /// Returns `true` when a record was evicted.
    pub fn push(&self, record: LogRecord) -> bool {
        let mut inner = self.lock();
        let evicted = if inner.records.len() >= self.capacity {
            inner.records.pop_front();
            inner.dropped += 1;
            true
        } else {
            false
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.push_back((seq, record));
        evicted
    }

    /// Push a record produced by `source` on `channel`.
    pub fn push_line(&self, source: &str, channel: LogChannel, payload: impl Into<String>) {
        self.push(LogRecord::new(source, channel, payload));
    }

    /// Push an operator-visible agent event.
    pub fn push_agent_op(&self, payload: impl Into<String>) {
        self.push(LogRecord::agent(LogChannel::AgentOp, payload));
    }

    /// Push a metric body.
    pub fn push_metric(&self, body: &serde_json::Value) {
        self.push(LogRecord::metric(body));
    }

    /// Clone of the oldest pending record.
    #[must_use]
    pub fn peek(&self) -> Option<Pending> {
        self.lock()
            .records
            .front()
            .map(|(seq, record)| Pending {
                seq: *seq,
                record: record.clone(),
            })
    }

    /// Remove the oldest record if it is still the one numbered `seq`.
    ///
    /// Returns `false` when it was evicted while its delivery was in flight.
    pub fn pop_delivered(&self, seq: u64) -> bool {
        let mut inner = self.lock();
        if inner.records.front().is_some_and(|(head, _)| *head == seq) {
            inner.records.pop_front();
            true
        } else {
            false
        }
    }

    /// Number of records evicted and not yet reported.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Subtract `count` reported drops from the counter.
    ///
    /// Drops that happened while the warning was in flight stay counted.
    pub fn acknowledge_dropped(&self, count: u64) {
        let mut inner = self.lock();
        inner.dropped = inner.dropped.saturating_sub(count);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the pending records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.lock()
            .records
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> LogRecord {
        LogRecord::new("task", LogChannel::Stdout, format!("line {n}"))
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let queue = BoundedLogQueue::new(8);
        for n in 0..50 {
            queue.push(line(n));
            assert!(queue.len() <= 8);
        }
        assert_eq!(queue.len(), 8);
        assert_eq!(queue.dropped(), 42);
    }

    #[test]
    fn test_eviction_keeps_newest_in_order() {
        let queue = BoundedLogQueue::new(3);
        for n in 0..5 {
            queue.push(line(n));
        }
        let payloads: Vec<_> = queue.snapshot().into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = BoundedLogQueue::new(4);
        queue.push(line(1));
        let pending = queue.peek().unwrap();
        assert_eq!(pending.record.payload, "line 1");
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_delivered(pending.seq));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_skips_record_evicted_in_flight() {
        let queue = BoundedLogQueue::new(2);
        queue.push(line(0));
        queue.push(line(1));
        let pending = queue.peek().unwrap();
        queue.push(line(2));
        assert!(!queue.pop_delivered(pending.seq));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().unwrap().record.payload, "line 1");
    }

    #[test]
    fn test_acknowledge_keeps_drops_raised_in_flight() {
        let queue = BoundedLogQueue::new(1);
        queue.push(line(0));
        queue.push(line(1));
        let reported = queue.dropped();
        queue.push(line(2));
        queue.acknowledge_dropped(reported);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = BoundedLogQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(line(0));
        queue.push(line(1));
        assert_eq!(queue.len(), 1);
    }
}
