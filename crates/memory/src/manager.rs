use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;
use serde::Deserialize;
use types::{PAddr, ResultCode, DRAM_BASE, PAGE_SIZE};

use crate::device_memory::DeviceMemory;
use crate::page_group::PageGroup;

/// Physical pools DRAM is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    Application = 0,
    Applet = 1,
    System = 2,
    SystemNonSecure = 3,
}

impl Pool {
    pub const ALL: [Pool; 4] = [
        Pool::Application,
        Pool::Applet,
        Pool::System,
        Pool::SystemNonSecure,
    ];
}

/// Which end of a pool allocations are taken from. Allocations with the same
/// lifetime use the same end so they stay packed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromFront,
    FromBack,
}

/// Byte size of every pool. Pools are laid out back to back from DRAM_BASE in
/// `Pool::ALL` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSizes {
    pub application: u64,
    pub applet: u64,
    pub system: u64,
    pub system_non_secure: u64,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            application: 0x0C00_0000,
            applet: 0x0200_0000,
            system: 0x0180_0000,
            system_non_secure: 0x0080_0000,
        }
    }
}

impl PoolSizes {
    pub fn total(&self) -> u64 {
        self.application + self.applet + self.system + self.system_non_secure
    }

    fn get(&self, pool: Pool) -> u64 {
        match pool {
            Pool::Application => self.application,
            Pool::Applet => self.applet,
            Pool::System => self.system,
            Pool::SystemNonSecure => self.system_non_secure,
        }
    }
}

/// Page bookkeeping for one pool: a reference count per page, zero = free.
#[derive(Debug)]
struct PoolManager {
    base: PAddr,
    ref_counts: Vec<u16>,
    free_pages: usize,
}

impl PoolManager {
    fn new(base: PAddr, num_pages: usize) -> Self {
        Self {
            base,
            ref_counts: vec![0; num_pages],
            free_pages: num_pages,
        }
    }

    fn contains(&self, addr: PAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn end(&self) -> PAddr {
        self.base + self.ref_counts.len() as u64 * PAGE_SIZE
    }

    fn index_of(&self, addr: PAddr) -> usize {
        ((addr - self.base) / PAGE_SIZE) as usize
    }

    fn scan_order(&self, direction: Direction) -> Box<dyn Iterator<Item = usize>> {
        let n = self.ref_counts.len();
        match direction {
            Direction::FromFront => Box::new(0..n),
            Direction::FromBack => Box::new((0..n).rev()),
        }
    }

    /// Takes `num_pages` free pages, possibly scattered. All-or-nothing.
    fn allocate(&mut self, num_pages: usize, direction: Direction) -> Option<PageGroup> {
        if num_pages == 0 || num_pages > self.free_pages {
            return None;
        }
        let mut picked: Vec<usize> = self
            .scan_order(direction)
            .filter(|&i| self.ref_counts[i] == 0)
            .take(num_pages)
            .collect();
        if picked.len() != num_pages {
            return None;
        }
        picked.sort_unstable();

        let mut group = PageGroup::new();
        for &i in &picked {
            self.ref_counts[i] = 1;
            group.add_block(self.base + i as u64 * PAGE_SIZE, 1);
        }
        self.free_pages -= num_pages;
        Some(group)
    }

    /// Takes one physically contiguous run of `num_pages`.
    fn allocate_contiguous(&mut self, num_pages: usize, direction: Direction) -> Option<PAddr> {
        if num_pages == 0 || num_pages > self.free_pages {
            return None;
        }
        let n = self.ref_counts.len();
        let mut run = 0usize;
        let mut found = None;
        for i in self.scan_order(direction) {
            if self.ref_counts[i] == 0 {
                run += 1;
                if run == num_pages {
                    found = Some(match direction {
                        Direction::FromFront => i + 1 - num_pages,
                        Direction::FromBack => i,
                    });
                    break;
                }
            } else {
                run = 0;
            }
        }
        let start = found?;
        debug_assert!(start + num_pages <= n);
        for count in &mut self.ref_counts[start..start + num_pages] {
            *count = 1;
        }
        self.free_pages -= num_pages;
        Some(self.base + start as u64 * PAGE_SIZE)
    }

    /// Adds a reference to every page, or to none of them if any count
    /// would overflow.
    fn open(&mut self, addr: PAddr, num_pages: usize) -> Result<(), ResultCode> {
        let start = self.index_of(addr);
        let counts = &mut self.ref_counts[start..start + num_pages];
        if counts.iter().any(|&count| count == u16::MAX) {
            return Err(ResultCode::OUT_OF_RESOURCE);
        }
        for count in counts {
            debug_assert!(*count > 0, "opening a free page");
            *count += 1;
        }
        Ok(())
    }

    /// Returns the freed extents so the caller can scrub them.
    fn close(&mut self, addr: PAddr, num_pages: usize) -> usize {
        let start = self.index_of(addr);
        let mut freed = 0;
        for count in &mut self.ref_counts[start..start + num_pages] {
            if *count == 0 {
                continue;
            }
            *count -= 1;
            if *count == 0 {
                freed += 1;
            }
        }
        self.free_pages += freed;
        freed
    }
}

/// Hands out physical pages from fixed pools.
#[derive(Debug)]
pub struct MemoryManager {
    device: Arc<DeviceMemory>,
    pools: Vec<Mutex<PoolManager>>,
    sizes: PoolSizes,
}

impl MemoryManager {
    pub fn new(device: Arc<DeviceMemory>, sizes: PoolSizes) -> Self {
        assert!(
            sizes.total() <= device.size(),
            "pool sizes (0x{:x}) exceed device memory (0x{:x})",
            sizes.total(),
            device.size()
        );
        let mut base = DRAM_BASE;
        let pools = Pool::ALL
            .iter()
            .map(|&pool| {
                let size = sizes.get(pool);
                let manager = PoolManager::new(base, (size / PAGE_SIZE) as usize);
                base += size;
                Mutex::new(manager)
            })
            .collect();
        Self { device, pools, sizes }
    }

    pub fn device_memory(&self) -> &Arc<DeviceMemory> {
        &self.device
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        self.sizes
    }

    fn pool(&self, pool: Pool) -> MutexGuard<'_, PoolManager> {
        self.pools[pool as usize]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn pool_of(&self, addr: PAddr) -> Option<Pool> {
        Pool::ALL.into_iter().find(|&p| self.pool(p).contains(addr))
    }

    /// Allocates `num_pages` pages from `pool` and opens them once.
    ///
    /// Fails with `OutOfMemory` without touching pool state when the pool
    /// cannot satisfy the whole request.
    pub fn allocate_and_open(
        &self,
        num_pages: usize,
        pool: Pool,
        direction: Direction,
    ) -> Result<PageGroup, ResultCode> {
        let group = self
            .pool(pool)
            .allocate(num_pages, direction)
            .ok_or(ResultCode::OUT_OF_MEMORY)?;
        for block in group.blocks() {
            self.device.fill(block.address, block.size() as usize, 0)?;
        }
        trace!("allocated {} pages from {:?} in {} extents", num_pages, pool, group.blocks().len());
        Ok(group)
    }

    /// Allocates one contiguous extent, opened once.
    pub fn allocate_contiguous(
        &self,
        num_pages: usize,
        pool: Pool,
        direction: Direction,
    ) -> Result<PAddr, ResultCode> {
        let addr = self
            .pool(pool)
            .allocate_contiguous(num_pages, direction)
            .ok_or(ResultCode::OUT_OF_MEMORY)?;
        self.device.fill(addr, num_pages * PAGE_SIZE as usize, 0)?;
        Ok(addr)
    }

    /// Adds a reference to every page of `group`. All-or-nothing.
    pub fn open(&self, group: &PageGroup) -> Result<(), ResultCode> {
        for (i, block) in group.blocks().iter().enumerate() {
            if let Err(rc) = self.open_range(block.address, block.num_pages) {
                for done in &group.blocks()[..i] {
                    self.close_range(done.address, done.num_pages);
                }
                return Err(rc);
            }
        }
        Ok(())
    }

    pub fn close(&self, group: &PageGroup) {
        for block in group.blocks() {
            self.close_range(block.address, block.num_pages);
        }
    }

    pub fn open_range(&self, addr: PAddr, num_pages: usize) -> Result<(), ResultCode> {
        match self.pool_of(addr) {
            Some(pool) => self.pool(pool).open(addr, num_pages),
            None => Ok(()),
        }
    }

    pub fn close_range(&self, addr: PAddr, num_pages: usize) {
        if let Some(pool) = self.pool_of(addr) {
            self.pool(pool).close(addr, num_pages);
        }
    }

    pub fn free_pages(&self, pool: Pool) -> usize {
        self.pool(pool).free_pages
    }

    pub fn total_pages(&self, pool: Pool) -> usize {
        self.pool(pool).ref_counts.len()
    }

    pub fn used_pages(&self, pool: Pool) -> usize {
        self.total_pages(pool) - self.free_pages(pool)
    }

    /// Reference count of the page at `addr` (0 = free).
    pub fn ref_count(&self, addr: PAddr) -> u16 {
        match self.pool_of(addr) {
            Some(pool) => {
                let p = self.pool(pool);
                p.ref_counts[p.index_of(addr)]
            }
            None => 0,
        }
    }
}
