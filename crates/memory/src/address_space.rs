use std::sync::Arc;

use log::{debug, trace};
use types::{
    align_down, is_aligned, MemoryAttribute, MemoryInfo, MemoryPermission, MemoryState, PAddr,
    ResultCode, VAddr, PAGE_SIZE,
};

use crate::block::{MemoryBlock, MemoryBlockManager};
use crate::layout::{AddressSpaceLayout, Region, RegionKind};
use crate::manager::{Direction, MemoryManager, Pool};
use crate::observer::MappingObserver;
use crate::page_group::PageGroup;
use crate::page_table::PageTable;

/// Bound on random address picks before `map_page_group_anywhere` gives up.
/// Exhausting it is a recoverable `OutOfMemory`, not a process fault.
pub const MAX_RANDOM_PLACEMENT_ATTEMPTS: usize = 64;

/// Granularity of SetHeapSize.
pub const HEAP_SIZE_ALIGNMENT: u64 = 0x20_0000;

/// xorshift64* stream used for placement; seeded per address space so runs
/// are reproducible.
#[derive(Debug, Clone)]
struct PlacementRng(u64);

impl PlacementRng {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// Per-process guest address space.
///
/// Owns the page table and the block manager and keeps both in step. Every
/// mapping opens one reference on each physical page it installs and every
/// unmap closes it, so a page is released once nothing maps it and no kernel
/// object (shared memory, a fresh allocation) still holds it open.
pub struct AddressSpace {
    asid: u64,
    layout: AddressSpaceLayout,
    page_table: PageTable,
    blocks: MemoryBlockManager,
    memory: Arc<MemoryManager>,
    pool: Pool,
    observers: Vec<Arc<dyn MappingObserver>>,
    heap_size: u64,
    rng: PlacementRng,
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("asid", &self.asid)
            .field("pool", &self.pool)
            .field("heap_size", &self.heap_size)
            .field("observers", &self.observers.len())
            .finish()
    }
}

fn check_aligned(addr: VAddr, size: u64) -> Result<(), ResultCode> {
    if !is_aligned(addr, PAGE_SIZE) {
        return Err(ResultCode::INVALID_ADDRESS);
    }
    if size == 0 || !is_aligned(size, PAGE_SIZE) {
        return Err(ResultCode::INVALID_SIZE);
    }
    Ok(())
}

impl AddressSpace {
    pub fn new(asid: u64, memory: Arc<MemoryManager>, pool: Pool, seed: u64) -> Self {
        let layout = AddressSpaceLayout::default();
        let blocks = MemoryBlockManager::new(0, layout.address_space_end());
        Self {
            asid,
            layout,
            page_table: PageTable::new(),
            blocks,
            memory,
            pool,
            observers: Vec::new(),
            heap_size: 0,
            rng: PlacementRng::new(seed ^ asid.rotate_left(17)),
        }
    }

    pub fn asid(&self) -> u64 {
        self.asid
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn layout(&self) -> &AddressSpaceLayout {
        &self.layout
    }

    pub fn region(&self, kind: RegionKind) -> Region {
        self.layout.region(kind)
    }

    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn add_observer(&mut self, observer: Arc<dyn MappingObserver>) {
        self.observers.push(observer);
    }

    fn notify_map(
        &self,
        addr: VAddr,
        size: u64,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        for (i, observer) in self.observers.iter().enumerate() {
            if let Err(rc) = observer.on_map(self.asid, addr, size, state, perm) {
                for done in &self.observers[..i] {
                    done.on_unmap(self.asid, addr, size);
                }
                return Err(rc);
            }
        }
        Ok(())
    }

    fn notify_unmap(&self, addr: VAddr, size: u64) {
        for observer in &self.observers {
            observer.on_unmap(self.asid, addr, size);
        }
    }

    /// Installs `group` at `addr`. Every target page must be free; an already
    /// mapped page rejects the whole request.
    pub fn map_page_group(
        &mut self,
        addr: VAddr,
        group: &PageGroup,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        let size = group.size();
        check_aligned(addr, size)?;
        if !self.blocks.contains(addr, size) {
            return Err(ResultCode::INVALID_MEMORY_REGION);
        }
        self.blocks.check_state(addr, size, MemoryState::Free)?;

        self.memory.open(group)?;
        let mut va = addr;
        for block in group.blocks() {
            self.page_table.map(va, block.address, block.num_pages, perm);
            va += block.size();
        }
        self.blocks
            .update(addr, size, state, perm, MemoryAttribute::empty());

        if let Err(rc) = self.notify_map(addr, size, state, perm) {
            debug!(
                "asid {}: observer rejected map 0x{:x}+0x{:x}: {}, rolling back",
                self.asid, addr, size, rc
            );
            self.page_table.unmap(addr, group.num_pages());
            self.memory.close(group);
            self.blocks.update(
                addr,
                size,
                MemoryState::Free,
                MemoryPermission::empty(),
                MemoryAttribute::empty(),
            );
            return Err(rc);
        }
        trace!(
            "asid {}: mapped 0x{:x}+0x{:x} {:?} {:?}",
            self.asid, addr, size, state, perm
        );
        Ok(())
    }

    /// Picks a free, randomly placed range inside `region` and maps `group`
    /// there. Gives up after [`MAX_RANDOM_PLACEMENT_ATTEMPTS`] picks.
    pub fn map_page_group_anywhere(
        &mut self,
        region: RegionKind,
        group: &PageGroup,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> Result<VAddr, ResultCode> {
        let size = group.size();
        let addr = self.find_free_area(region, size)?;
        self.map_page_group(addr, group, state, perm)?;
        Ok(addr)
    }

    fn find_free_area(&mut self, kind: RegionKind, size: u64) -> Result<VAddr, ResultCode> {
        let region = self.layout.region(kind);
        if size == 0 || size > region.size {
            return Err(ResultCode::OUT_OF_MEMORY);
        }
        let slots = (region.size - size) / PAGE_SIZE + 1;
        for _ in 0..MAX_RANDOM_PLACEMENT_ATTEMPTS {
            let candidate = region.start + (self.rng.next_u64() % slots) * PAGE_SIZE;
            if self
                .blocks
                .check_state(candidate, size, MemoryState::Free)
                .is_ok()
            {
                return Ok(candidate);
            }
        }
        debug!(
            "asid {}: no free 0x{:x} bytes in {:?} after {} attempts",
            self.asid, size, kind, MAX_RANDOM_PLACEMENT_ATTEMPTS
        );
        Err(ResultCode::OUT_OF_MEMORY)
    }

    /// Allocates fresh zeroed pages from the process pool and maps them at
    /// `addr`. The mapping holds the only reference.
    pub fn allocate_and_map(
        &mut self,
        addr: VAddr,
        num_pages: usize,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        let group = self
            .memory
            .allocate_and_open(num_pages, self.pool, Direction::FromFront)?;
        let result = self.map_page_group(addr, &group, state, perm);
        self.memory.close(&group);
        result
    }

    pub fn allocate_and_map_anywhere(
        &mut self,
        region: RegionKind,
        num_pages: usize,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> Result<VAddr, ResultCode> {
        let group = self
            .memory
            .allocate_and_open(num_pages, self.pool, Direction::FromFront)?;
        let result = self.map_page_group_anywhere(region, &group, state, perm);
        self.memory.close(&group);
        result
    }

    fn unmap_range(&mut self, addr: VAddr, size: u64) {
        let mut va = addr;
        while va < addr + size {
            if let Some((paddr, _)) = self.page_table.translate(va) {
                self.memory.close_range(paddr, 1);
            }
            va += PAGE_SIZE;
        }
        self.page_table.unmap(addr, (size / PAGE_SIZE) as usize);
        self.blocks.update(
            addr,
            size,
            MemoryState::Free,
            MemoryPermission::empty(),
            MemoryAttribute::empty(),
        );
        self.notify_unmap(addr, size);
    }

    /// Unmaps `num_pages` at `addr`; the whole range must be in `state`.
    pub fn unmap_pages(
        &mut self,
        addr: VAddr,
        num_pages: usize,
        state: MemoryState,
    ) -> Result<(), ResultCode> {
        let size = num_pages as u64 * PAGE_SIZE;
        check_aligned(addr, size)?;
        self.blocks.check_state(addr, size, state)?;
        self.unmap_range(addr, size);
        trace!("asid {}: unmapped 0x{:x}+0x{:x}", self.asid, addr, size);
        Ok(())
    }

    /// Physical pages currently backing `[addr, addr + num_pages)`.
    pub fn page_group_of(&self, addr: VAddr, num_pages: usize) -> Result<PageGroup, ResultCode> {
        let mut group = PageGroup::new();
        for i in 0..num_pages as u64 {
            let (paddr, _) = self
                .page_table
                .translate(addr + i * PAGE_SIZE)
                .ok_or(ResultCode::INVALID_CURRENT_MEMORY)?;
            group.add_block(paddr, 1);
        }
        Ok(group)
    }

    /// SetHeapSize: grows or shrinks the heap, which always starts at the
    /// heap region base. Returns that base.
    pub fn set_heap_size(&mut self, size: u64) -> Result<VAddr, ResultCode> {
        if !is_aligned(size, HEAP_SIZE_ALIGNMENT) {
            return Err(ResultCode::INVALID_SIZE);
        }
        let heap = self.layout.region(RegionKind::Heap);
        if size > heap.size {
            return Err(ResultCode::OUT_OF_MEMORY);
        }
        let current = self.heap_size;
        if size > current {
            let grow = size - current;
            self.allocate_and_map(
                heap.start + current,
                (grow / PAGE_SIZE) as usize,
                MemoryState::Normal,
                MemoryPermission::READ_WRITE,
            )?;
        } else if size < current {
            let shrink_at = heap.start + size;
            let shrink = current - size;
            self.blocks.check_range(shrink_at, shrink, |b| {
                b.state == MemoryState::Normal
                    && b.permission == MemoryPermission::READ_WRITE
                    && b.attribute.is_empty()
            })?;
            self.unmap_range(shrink_at, shrink);
        }
        debug!("asid {}: heap 0x{:x} -> 0x{:x}", self.asid, current, size);
        self.heap_size = size;
        Ok(heap.start)
    }

    /// SetMemoryPermission on a range whose state allows reprotection.
    pub fn set_memory_permission(
        &mut self,
        addr: VAddr,
        size: u64,
        perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        check_aligned(addr, size)?;
        if !perm.is_user_settable() {
            return Err(ResultCode::INVALID_NEW_MEMORY_PERMISSION);
        }
        if !self.blocks.contains(addr, size) {
            return Err(ResultCode::INVALID_CURRENT_MEMORY);
        }
        let first = self.blocks.find(addr).copied().ok_or(ResultCode::INVALID_CURRENT_MEMORY)?;
        self.blocks.check_range(addr, size, |b| {
            b.state == first.state && b.state.can_reprotect() && b.attribute.is_empty()
        })?;
        self.page_table.protect(addr, (size / PAGE_SIZE) as usize, perm);
        self.blocks
            .update(addr, size, first.state, perm, MemoryAttribute::empty());
        for observer in &self.observers {
            observer.on_protect(self.asid, addr, size, perm);
        }
        Ok(())
    }

    /// MapMemory: aliases `size` bytes of normal memory at `src` into the
    /// stack region at `dst`. The source is locked and made inaccessible
    /// until the alias is removed.
    pub fn map_memory(&mut self, dst: VAddr, src: VAddr, size: u64) -> Result<(), ResultCode> {
        check_aligned(dst, size)?;
        check_aligned(src, 0x1000).map_err(|_| ResultCode::INVALID_ADDRESS)?;
        if !self.layout.region(RegionKind::Stack).contains(dst, size) {
            return Err(ResultCode::INVALID_MEMORY_REGION);
        }
        self.blocks.check_range(src, size, |b| {
            b.state.can_alias()
                && b.permission == MemoryPermission::READ_WRITE
                && b.attribute.is_empty()
        })?;
        self.blocks.check_state(dst, size, MemoryState::Free)?;

        let num_pages = (size / PAGE_SIZE) as usize;
        let group = self.page_group_of(src, num_pages)?;
        self.map_page_group(dst, &group, MemoryState::Stack, MemoryPermission::READ_WRITE)?;

        self.page_table
            .protect(src, num_pages, MemoryPermission::empty());
        self.blocks.update(
            src,
            size,
            MemoryState::Normal,
            MemoryPermission::empty(),
            MemoryAttribute::LOCKED,
        );
        Ok(())
    }

    /// UnmapMemory: reverses [`map_memory`](Self::map_memory). Both sides must
    /// still be backed by the same physical pages.
    pub fn unmap_memory(&mut self, dst: VAddr, src: VAddr, size: u64) -> Result<(), ResultCode> {
        check_aligned(dst, size)?;
        check_aligned(src, 0x1000).map_err(|_| ResultCode::INVALID_ADDRESS)?;
        self.blocks.check_range(src, size, |b| {
            b.state == MemoryState::Normal && b.attribute == MemoryAttribute::LOCKED
        })?;
        self.blocks.check_state(dst, size, MemoryState::Stack)?;

        let num_pages = (size / PAGE_SIZE) as usize;
        let src_pages = self.page_group_of(src, num_pages)?;
        let dst_pages = self.page_group_of(dst, num_pages)?;
        if !src_pages.is_equivalent_to(&dst_pages) {
            return Err(ResultCode::INVALID_MEMORY_REGION);
        }

        self.unmap_range(dst, size);
        self.page_table
            .protect(src, num_pages, MemoryPermission::READ_WRITE);
        self.blocks.update(
            src,
            size,
            MemoryState::Normal,
            MemoryPermission::READ_WRITE,
            MemoryAttribute::empty(),
        );
        Ok(())
    }

    pub fn query_memory(&self, addr: VAddr) -> MemoryInfo {
        self.blocks.query(addr)
    }

    pub fn block_at(&self, addr: VAddr) -> Option<MemoryBlock> {
        self.blocks.find(addr).copied()
    }

    pub fn translate(&self, addr: VAddr) -> Option<PAddr> {
        self.page_table.translate(addr).map(|(paddr, _)| paddr)
    }

    pub fn is_mapped(&self, addr: VAddr) -> bool {
        self.page_table.is_mapped(addr)
    }

    fn for_each_page<F>(&self, addr: VAddr, len: usize, mut f: F) -> Result<(), ResultCode>
    where
        F: FnMut(PAddr, usize, usize) -> Result<(), ResultCode>,
    {
        let mut done = 0usize;
        while done < len {
            let va = addr + done as u64;
            let paddr = self.translate(va).ok_or(ResultCode::INVALID_POINTER)?;
            let page_remaining = (align_down(va, PAGE_SIZE) + PAGE_SIZE - va) as usize;
            let chunk = page_remaining.min(len - done);
            f(paddr, done, chunk)?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies guest memory into `out`, crossing page boundaries through the
    /// page table. Kernel accesses ignore page permissions.
    pub fn read(&self, addr: VAddr, out: &mut [u8]) -> Result<(), ResultCode> {
        let device = self.memory.device_memory();
        self.for_each_page(addr, out.len(), |paddr, offset, len| {
            device.read(paddr, &mut out[offset..offset + len])
        })
    }

    pub fn write(&self, addr: VAddr, data: &[u8]) -> Result<(), ResultCode> {
        let device = self.memory.device_memory();
        self.for_each_page(addr, data.len(), |paddr, offset, len| {
            device.write(paddr, &data[offset..offset + len])
        })
    }

    pub fn read_bytes(&self, addr: VAddr, len: usize) -> Result<Vec<u8>, ResultCode> {
        let mut out = vec![0u8; len];
        self.read(addr, &mut out)?;
        Ok(out)
    }

    pub fn read_u32(&self, addr: VAddr) -> Result<u32, ResultCode> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: VAddr) -> Result<u64, ResultCode> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u32(&self, addr: VAddr, value: u32) -> Result<(), ResultCode> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: VAddr, value: u64) -> Result<(), ResultCode> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes.
    pub fn read_cstring(&self, addr: VAddr, max_len: usize) -> Result<String, ResultCode> {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        for i in 0..max_len as u64 {
            self.read(addr + i, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Unmaps everything. Called when the owning process is destroyed.
    pub fn finalize(&mut self) {
        let mapped: Vec<MemoryBlock> = self
            .blocks
            .blocks()
            .filter(|b| b.state != MemoryState::Free)
            .copied()
            .collect();
        for block in mapped {
            self.unmap_range(block.base, block.size);
        }
        self.heap_size = 0;
    }
}
