use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum LimitableResource {
    PhysicalMemory = 0,
    Threads = 1,
    Events = 2,
    TransferMemories = 3,
    Sessions = 4,
}

impl LimitableResource {
    pub const COUNT: usize = 5;
}

/// Default limit values applied to every new process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceLimitValues {
    pub physical_memory: i64,
    pub threads: i64,
    pub events: i64,
    pub transfer_memories: i64,
    pub sessions: i64,
}

impl Default for ResourceLimitValues {
    fn default() -> Self {
        Self {
            physical_memory: 0x0C00_0000,
            threads: 256,
            events: 512,
            transfer_memories: 64,
            sessions: 256,
        }
    }
}

impl ResourceLimitValues {
    fn as_array(&self) -> [i64; LimitableResource::COUNT] {
        [
            self.physical_memory,
            self.threads,
            self.events,
            self.transfer_memories,
            self.sessions,
        ]
    }
}

/// Bounds on what a process may hold. Reservations either fit entirely or
/// change nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimit {
    limit: [i64; LimitableResource::COUNT],
    current: [i64; LimitableResource::COUNT],
    peak: [i64; LimitableResource::COUNT],
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self {
            limit: [0; LimitableResource::COUNT],
            current: [0; LimitableResource::COUNT],
            peak: [0; LimitableResource::COUNT],
        }
    }
}

impl ResourceLimit {
    pub fn new(values: &ResourceLimitValues) -> Self {
        Self {
            limit: values.as_array(),
            ..Default::default()
        }
    }

    pub fn limit_value(&self, which: LimitableResource) -> i64 {
        self.limit[which as usize]
    }

    pub fn current_value(&self, which: LimitableResource) -> i64 {
        self.current[which as usize]
    }

    pub fn peak_value(&self, which: LimitableResource) -> i64 {
        self.peak[which as usize]
    }

    pub fn free_value(&self, which: LimitableResource) -> i64 {
        self.limit[which as usize] - self.current[which as usize]
    }

    /// Fails when `value` is below what is already in use.
    pub fn set_limit_value(&mut self, which: LimitableResource, value: i64) -> bool {
        let i = which as usize;
        if value < self.current[i] {
            return false;
        }
        self.limit[i] = value;
        true
    }

    pub fn reserve(&mut self, which: LimitableResource, amount: i64) -> bool {
        let i = which as usize;
        if amount < 0 || self.current[i] + amount > self.limit[i] {
            return false;
        }
        self.current[i] += amount;
        self.peak[i] = self.peak[i].max(self.current[i]);
        true
    }

    pub fn release(&mut self, which: LimitableResource, amount: i64) {
        let i = which as usize;
        self.current[i] = (self.current[i] - amount).max(0);
    }
}
