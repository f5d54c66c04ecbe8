use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::arena::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: Instant,
    seq: u64,
}

impl TimerKey {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Wait deadlines ordered by expiry.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<TimerKey, ObjectId>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, thread: ObjectId) -> TimerKey {
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, thread);
        key
    }

    pub fn cancel(&mut self, key: TimerKey) {
        self.entries.remove(&key);
    }

    /// Removes and returns every thread whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<ObjectId> {
        let mut expired = Vec::new();
        while let Some((key, _)) = self.entries.first_key_value() {
            if key.deadline > now {
                break;
            }
            if let Some((_, thread)) = self.entries.pop_first() {
                expired.push(thread);
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|k| k.deadline)
    }

    /// Time until the next deadline, capped at `max`.
    pub fn time_to_next(&self, now: Instant, max: Duration) -> Duration {
        match self.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(max),
            None => max,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
