use std::collections::BTreeMap;

use types::{MemoryAttribute, MemoryInfo, MemoryPermission, MemoryState, ResultCode, VAddr};

/// A maximal run of guest pages that share state, permission and attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub base: VAddr,
    pub size: u64,
    pub state: MemoryState,
    pub permission: MemoryPermission,
    pub attribute: MemoryAttribute,
}

impl MemoryBlock {
    pub fn end(&self) -> VAddr {
        self.base + self.size
    }

    fn same_properties(&self, other: &MemoryBlock) -> bool {
        self.state == other.state
            && self.permission == other.permission
            && self.attribute == other.attribute
    }

    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            base_address: self.base,
            size: self.size,
            state: self.state,
            attribute: self.attribute,
            permission: self.permission,
            ipc_ref_count: 0,
            device_ref_count: 0,
        }
    }
}

/// Tracks the state of every byte of `[start, end)` as a set of
/// non-overlapping, adjacent blocks keyed by base address.
///
/// Neighbouring blocks with identical properties are always merged, so two
/// managers describing the same address space compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlockManager {
    start: VAddr,
    end: VAddr,
    blocks: BTreeMap<VAddr, MemoryBlock>,
}

impl MemoryBlockManager {
    pub fn new(start: VAddr, end: VAddr) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            start,
            MemoryBlock {
                base: start,
                size: end - start,
                state: MemoryState::Free,
                permission: MemoryPermission::empty(),
                attribute: MemoryAttribute::empty(),
            },
        );
        Self { start, end, blocks }
    }

    pub fn start(&self) -> VAddr {
        self.start
    }

    pub fn end(&self) -> VAddr {
        self.end
    }

    pub fn contains(&self, addr: VAddr, size: u64) -> bool {
        match addr.checked_add(size) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }

    /// Block containing `addr`.
    pub fn find(&self, addr: VAddr) -> Option<&MemoryBlock> {
        let (_, block) = self.blocks.range(..=addr).next_back()?;
        (addr < block.end()).then_some(block)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.blocks.values()
    }

    fn split_at(&mut self, addr: VAddr) {
        if addr <= self.start || addr >= self.end {
            return;
        }
        let Some(block) = self.find(addr).copied() else {
            return;
        };
        if block.base == addr {
            return;
        }
        let head = addr - block.base;
        self.blocks.insert(
            block.base,
            MemoryBlock {
                size: head,
                ..block
            },
        );
        self.blocks.insert(
            addr,
            MemoryBlock {
                base: addr,
                size: block.size - head,
                ..block
            },
        );
    }

    fn coalesce_around(&mut self, start: VAddr, end: VAddr) {
        let first = self
            .blocks
            .range(..start)
            .next_back()
            .map(|(k, _)| *k)
            .unwrap_or(start);
        let keys: Vec<VAddr> = self.blocks.range(first..=end).map(|(k, _)| *k).collect();
        let mut current: Option<VAddr> = None;
        for key in keys {
            let Some(block) = self.blocks.get(&key).copied() else {
                continue;
            };
            if let Some(prev_key) = current {
                let prev = self.blocks[&prev_key];
                if prev.end() == block.base && prev.same_properties(&block) {
                    self.blocks.remove(&key);
                    if let Some(prev) = self.blocks.get_mut(&prev_key) {
                        prev.size += block.size;
                    }
                    continue;
                }
            }
            current = Some(key);
        }
    }

    /// Sets the properties of `[addr, addr + size)`, splitting and merging
    /// blocks as needed. The range must lie inside the manager.
    pub fn update(
        &mut self,
        addr: VAddr,
        size: u64,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) {
        if size == 0 || !self.contains(addr, size) {
            return;
        }
        let end = addr + size;
        self.split_at(addr);
        self.split_at(end);
        for (_, block) in self.blocks.range_mut(addr..end) {
            block.state = state;
            block.permission = permission;
            block.attribute = attribute;
        }
        self.coalesce_around(addr, end);
    }

    /// Checks that every block overlapping `[addr, addr + size)` satisfies
    /// `pred`, and returns the first one.
    pub fn check_range<F>(&self, addr: VAddr, size: u64, pred: F) -> Result<MemoryBlock, ResultCode>
    where
        F: Fn(&MemoryBlock) -> bool,
    {
        if size == 0 || !self.contains(addr, size) {
            return Err(ResultCode::INVALID_CURRENT_MEMORY);
        }
        let end = addr + size;
        let first = *self.find(addr).ok_or(ResultCode::INVALID_CURRENT_MEMORY)?;
        let mut cursor = first;
        loop {
            if !pred(&cursor) {
                return Err(ResultCode::INVALID_CURRENT_MEMORY);
            }
            if cursor.end() >= end {
                return Ok(first);
            }
            cursor = *self
                .find(cursor.end())
                .ok_or(ResultCode::INVALID_CURRENT_MEMORY)?;
        }
    }

    /// Checks that the whole range is in a single `state`.
    pub fn check_state(&self, addr: VAddr, size: u64, state: MemoryState) -> Result<MemoryBlock, ResultCode> {
        self.check_range(addr, size, |b| b.state == state)
    }

    /// QueryMemory: the block holding `addr`, or an inaccessible block
    /// covering everything past the managed range.
    pub fn query(&self, addr: VAddr) -> MemoryInfo {
        match self.find(addr) {
            Some(block) => block.info(),
            None if addr >= self.end => MemoryInfo {
                base_address: self.end,
                size: 0u64.wrapping_sub(self.end),
                state: MemoryState::Inaccessible,
                attribute: MemoryAttribute::empty(),
                permission: MemoryPermission::empty(),
                ipc_ref_count: 0,
                device_ref_count: 0,
            },
            None => MemoryInfo {
                base_address: 0,
                size: self.start,
                state: MemoryState::Inaccessible,
                attribute: MemoryAttribute::empty(),
                permission: MemoryPermission::empty(),
                ipc_ref_count: 0,
                device_ref_count: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: VAddr = 0x1000_0000;
    const END: VAddr = 0x2000_0000;

    #[test]
    fn update_splits_then_merges_back() {
        let original = MemoryBlockManager::new(START, END);
        let mut mgr = original.clone();
        mgr.update(START + 0x4000, 0x2000, MemoryState::Normal, MemoryPermission::READ_WRITE, MemoryAttribute::empty());
        assert_eq!(mgr.blocks().count(), 3);
        assert_eq!(mgr.find(START + 0x5000).map(|b| b.state), Some(MemoryState::Normal));

        mgr.update(START + 0x4000, 0x2000, MemoryState::Free, MemoryPermission::empty(), MemoryAttribute::empty());
        assert_eq!(mgr, original);
    }

    #[test]
    fn adjacent_updates_merge() {
        let mut mgr = MemoryBlockManager::new(START, END);
        mgr.update(START, 0x1000, MemoryState::Normal, MemoryPermission::READ_WRITE, MemoryAttribute::empty());
        mgr.update(START + 0x1000, 0x1000, MemoryState::Normal, MemoryPermission::READ_WRITE, MemoryAttribute::empty());
        let first = mgr.find(START).copied();
        assert_eq!(first.map(|b| b.size), Some(0x2000));
    }

    #[test]
    fn check_range_spans_blocks() {
        let mut mgr = MemoryBlockManager::new(START, END);
        mgr.update(START + 0x1000, 0x1000, MemoryState::Normal, MemoryPermission::READ, MemoryAttribute::empty());
        mgr.update(START + 0x2000, 0x1000, MemoryState::Normal, MemoryPermission::READ_WRITE, MemoryAttribute::empty());
        assert!(mgr
            .check_range(START + 0x1000, 0x2000, |b| b.state == MemoryState::Normal)
            .is_ok());
        assert_eq!(
            mgr.check_state(START, 0x2000, MemoryState::Normal),
            Err(ResultCode::INVALID_CURRENT_MEMORY)
        );
    }

    #[test]
    fn query_past_end_is_inaccessible() {
        let mgr = MemoryBlockManager::new(START, END);
        let info = mgr.query(END + 0x1000);
        assert_eq!(info.state, MemoryState::Inaccessible);
        assert_eq!(info.base_address, END);
    }
}
