use std::collections::VecDeque;
use std::time::{Duration, Instant};

use cpu::HaltSignal;

use crate::arena::ObjectId;

pub const NUM_PRIORITIES: usize = 64;
pub const LOWEST_PRIORITY: u8 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Queued {
    thread: ObjectId,
    affinity: u64,
}

#[derive(Debug, Clone, Copy)]
struct Running {
    thread: ObjectId,
    priority: u8,
    since: Instant,
}

/// Ready queues and per-core occupancy.
///
/// One FIFO per priority level; a core takes the first thread of the most
/// urgent level whose affinity mask includes it. Equal-priority threads
/// rotate when a running thread's quantum expires.
#[derive(Debug)]
pub struct Scheduler {
    ready: Vec<VecDeque<Queued>>,
    running: Vec<Option<Running>>,
    halts: Vec<HaltSignal>,
    quantum: Duration,
}

impl Scheduler {
    pub fn new(halts: Vec<HaltSignal>, quantum: Duration) -> Self {
        let num_cores = halts.len();
        Self {
            ready: (0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect(),
            running: vec![None; num_cores],
            halts,
            quantum,
        }
    }

    pub fn num_cores(&self) -> usize {
        self.running.len()
    }

    pub fn halt_signal(&self, core: usize) -> Option<&HaltSignal> {
        self.halts.get(core)
    }

    pub fn enqueue(&mut self, thread: ObjectId, priority: u8, affinity: u64, front: bool) {
        let level = &mut self.ready[priority.min(LOWEST_PRIORITY) as usize];
        let entry = Queued { thread, affinity };
        if front {
            level.push_front(entry);
        } else {
            level.push_back(entry);
        }
    }

    pub fn remove(&mut self, thread: ObjectId) -> bool {
        for level in &mut self.ready {
            if let Some(pos) = level.iter().position(|q| q.thread == thread) {
                level.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn is_queued(&self, thread: ObjectId) -> bool {
        self.ready
            .iter()
            .any(|level| level.iter().any(|q| q.thread == thread))
    }

    /// Takes the most urgent ready thread that may run on `core`.
    pub fn pick(&mut self, core: usize) -> Option<ObjectId> {
        let bit = 1u64 << core;
        for level in &mut self.ready {
            if let Some(pos) = level.iter().position(|q| q.affinity & bit != 0) {
                return level.remove(pos).map(|q| q.thread);
            }
        }
        None
    }

    /// Priority of the most urgent thread waiting for `core`.
    pub fn best_ready_priority(&self, core: usize) -> Option<u8> {
        let bit = 1u64 << core;
        self.ready
            .iter()
            .position(|level| level.iter().any(|q| q.affinity & bit != 0))
            .map(|p| p as u8)
    }

    /// Records `thread` as running on `core`. A thread picked again on the
    /// same core keeps the start of its quantum.
    pub fn set_running(&mut self, core: usize, thread: ObjectId, priority: u8) {
        let since = match self.running[core] {
            Some(r) if r.thread == thread => r.since,
            _ => Instant::now(),
        };
        for (other, slot) in self.running.iter_mut().enumerate() {
            if other != core && slot.map(|r| r.thread) == Some(thread) {
                *slot = None;
            }
        }
        self.running[core] = Some(Running {
            thread,
            priority,
            since,
        });
    }

    pub fn clear_running(&mut self, core: usize) {
        self.running[core] = None;
    }

    pub fn running(&self, core: usize) -> Option<ObjectId> {
        self.running.get(core).copied().flatten().map(|r| r.thread)
    }

    pub fn running_core(&self, thread: ObjectId) -> Option<usize> {
        self.running
            .iter()
            .position(|r| r.map(|r| r.thread) == Some(thread))
    }

    pub fn update_running_priority(&mut self, thread: ObjectId, priority: u8) {
        for r in self.running.iter_mut().flatten() {
            if r.thread == thread {
                r.priority = priority;
            }
        }
    }

    pub fn quantum_expired(&self, core: usize) -> bool {
        match self.running.get(core).copied().flatten() {
            Some(r) => r.since.elapsed() >= self.quantum,
            None => false,
        }
    }

    /// Interrupts every core whose thread has used up its quantum while a
    /// thread at least as urgent waits for that core. Returns the earliest
    /// moment another contended quantum runs out.
    pub fn expire_quanta(&self, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for (core, running) in self.running.iter().enumerate() {
            let Some(r) = running else {
                continue;
            };
            let contended = self
                .best_ready_priority(core)
                .map_or(false, |p| p <= r.priority);
            if !contended {
                continue;
            }
            let end = r.since + self.quantum;
            if now >= end {
                self.halts[core].raise();
            } else {
                next = Some(next.map_or(end, |n| n.min(end)));
            }
        }
        next
    }

    /// Called when `priority` becomes ready with `affinity`: interrupts
    /// every allowed core running something less urgent. Returns whether any
    /// allowed core is idle.
    pub fn request_preemption(&self, priority: u8, affinity: u64) -> bool {
        let mut idle = false;
        for (core, running) in self.running.iter().enumerate() {
            if affinity & (1 << core) == 0 {
                continue;
            }
            match running {
                None => idle = true,
                Some(r) if priority < r.priority => self.halts[core].raise(),
                Some(_) => {}
            }
        }
        idle
    }

    /// Interrupts the core running `thread`, if any.
    pub fn interrupt(&self, thread: ObjectId) {
        if let Some(core) = self.running_core(thread) {
            self.halts[core].raise();
        }
    }

    pub fn ready_count(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }
}
