use crate::arena::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiter {
    thread: ObjectId,
    priority: u8,
    seq: u64,
}

/// Threads blocked on one object, kept in wake order: ascending priority
/// value (0 is the most urgent), then insertion order.
#[derive(Debug, Default, Clone)]
pub struct WaitQueue {
    waiters: Vec<Waiter>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// `seq` must increase across every queue in the kernel so ties keep
    /// arrival order even after priority changes.
    pub fn push(&mut self, thread: ObjectId, priority: u8, seq: u64) {
        let waiter = Waiter { thread, priority, seq };
        let at = self
            .waiters
            .partition_point(|w| (w.priority, w.seq) <= (priority, seq));
        self.waiters.insert(at, waiter);
    }

    pub fn remove(&mut self, thread: ObjectId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.thread != thread);
        before != self.waiters.len()
    }

    pub fn contains(&self, thread: ObjectId) -> bool {
        self.waiters.iter().any(|w| w.thread == thread)
    }

    pub fn front(&self) -> Option<ObjectId> {
        self.waiters.first().map(|w| w.thread)
    }

    pub fn pop_front(&mut self) -> Option<ObjectId> {
        if self.waiters.is_empty() {
            None
        } else {
            Some(self.waiters.remove(0).thread)
        }
    }

    /// Removes and returns every waiter, most urgent first.
    pub fn take_all(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.waiters)
            .into_iter()
            .map(|w| w.thread)
            .collect()
    }

    pub fn threads(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.waiters.iter().map(|w| w.thread)
    }

    /// Re-sorts a waiter whose priority changed.
    pub fn update_priority(&mut self, thread: ObjectId, priority: u8) {
        if let Some(pos) = self.waiters.iter().position(|w| w.thread == thread) {
            let waiter = self.waiters.remove(pos);
            self.push(thread, priority, waiter.seq);
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
