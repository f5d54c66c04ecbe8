use std::sync::{Arc, RwLock};

use memory::AddressSpace;
use types::{ResultCode, VAddr, PAGE_SIZE};

use crate::arena::ObjectId;
use crate::handle_table::HandleTable;
use crate::sync::WaitQueue;

pub const TLS_SLOT_SIZE: u64 = 0x200;
pub const TLS_SLOTS_PER_PAGE: usize = (PAGE_SIZE / TLS_SLOT_SIZE) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    Exiting,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPage {
    pub address: VAddr,
    pub used: [bool; TLS_SLOTS_PER_PAGE],
}

impl TlsPage {
    pub fn new(address: VAddr) -> Self {
        Self {
            address,
            used: [false; TLS_SLOTS_PER_PAGE],
        }
    }

    pub fn take_slot(&mut self) -> Option<VAddr> {
        let slot = self.used.iter().position(|used| !used)?;
        self.used[slot] = true;
        Some(self.address + slot as u64 * TLS_SLOT_SIZE)
    }

    pub fn release(&mut self, addr: VAddr) -> bool {
        if addr < self.address || addr >= self.address + PAGE_SIZE {
            return false;
        }
        let slot = ((addr - self.address) / TLS_SLOT_SIZE) as usize;
        self.used[slot] = false;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.used.iter().all(|used| !used)
    }
}

/// Thread blocked in WaitForAddress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWaiter {
    pub addr: VAddr,
    pub thread: ObjectId,
    pub priority: u8,
    pub seq: u64,
}

/// Thread blocked in WaitProcessWideKeyAtomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionWaiter {
    pub key: VAddr,
    pub mutex: VAddr,
    pub thread: ObjectId,
    pub priority: u8,
    pub seq: u64,
}

#[derive(Debug)]
pub struct Process {
    pub pid: u64,
    pub name: String,
    pub program_id: u64,
    pub state: ProcessState,
    pub address_space: Arc<RwLock<AddressSpace>>,
    pub handles: HandleTable,
    pub resource_limit: ObjectId,
    pub threads: Vec<ObjectId>,
    pub waiters: WaitQueue,
    pub signaled: bool,
    pub tls_pages: Vec<TlsPage>,
    pub ideal_core: usize,
    pub core_mask: u64,
    /// Most urgent priority threads of this process may use.
    pub highest_priority: u8,
    pub address_waiters: Vec<AddressWaiter>,
    pub condition_waiters: Vec<ConditionWaiter>,
    /// Heap bytes charged to the resource limit.
    pub heap_charged: u64,
    pub entropy: [u64; 4],
}

impl Process {
    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Terminated)
    }

    pub fn find_tls_slot(&mut self) -> Option<VAddr> {
        self.tls_pages.iter_mut().find_map(TlsPage::take_slot)
    }

    /// Frees a slot; returns the page address once the page is unused.
    pub fn release_tls_slot(&mut self, addr: VAddr) -> Option<VAddr> {
        let pos = self.tls_pages.iter_mut().position(|p| p.release(addr))?;
        if self.tls_pages[pos].is_empty() {
            return Some(self.tls_pages.remove(pos).address);
        }
        None
    }

    pub fn check_core(&self, core: usize) -> Result<(), ResultCode> {
        if core >= 64 || self.core_mask & (1 << core) == 0 {
            return Err(ResultCode::INVALID_CORE_ID);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_page_hands_out_eight_slots() {
        let mut page = TlsPage::new(0x40_0000_0000);
        let slots: Vec<_> = (0..TLS_SLOTS_PER_PAGE).filter_map(|_| page.take_slot()).collect();
        assert_eq!(slots.len(), 8);
        assert_eq!(slots[1], 0x40_0000_0200);
        assert_eq!(page.take_slot(), None);
        assert!(page.release(slots[3]));
        assert_eq!(page.take_slot(), Some(slots[3]));
    }
}
