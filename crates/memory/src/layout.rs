use types::VAddr;

use crate::page_table::ADDRESS_SPACE_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Code,
    Alias,
    Heap,
    Stack,
    /// Kernel-reserved; thread-local pages live here.
    KernelMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub start: VAddr,
    pub size: u64,
}

impl Region {
    pub fn end(&self) -> VAddr {
        self.start + self.size
    }

    pub fn contains(&self, addr: VAddr, size: u64) -> bool {
        match addr.checked_add(size) {
            Some(end) => addr >= self.start && end <= self.end(),
            None => false,
        }
    }
}

/// Fixed region carve-out of a 39-bit address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    regions: [Region; 5],
}

impl Default for AddressSpaceLayout {
    fn default() -> Self {
        Self::new_39bit()
    }
}

impl AddressSpaceLayout {
    pub const CODE_START: VAddr = 0x0800_0000;
    pub const CODE_END: VAddr = 0x8000_0000;
    pub const ALIAS_START: VAddr = 0x10_0000_0000;
    pub const ALIAS_SIZE: u64 = 0x10_0000_0000;
    pub const HEAP_START: VAddr = 0x20_0000_0000;
    pub const HEAP_SIZE: u64 = 0x2_0000_0000;
    pub const STACK_START: VAddr = 0x30_0000_0000;
    pub const STACK_SIZE: u64 = 0x8000_0000;
    pub const KERNEL_MAP_START: VAddr = 0x40_0000_0000;
    pub const KERNEL_MAP_SIZE: u64 = 0x10_0000_0000;

    pub fn new_39bit() -> Self {
        let region = |kind, start, size| Region { kind, start, size };
        Self {
            regions: [
                region(RegionKind::Code, Self::CODE_START, Self::CODE_END - Self::CODE_START),
                region(RegionKind::Alias, Self::ALIAS_START, Self::ALIAS_SIZE),
                region(RegionKind::Heap, Self::HEAP_START, Self::HEAP_SIZE),
                region(RegionKind::Stack, Self::STACK_START, Self::STACK_SIZE),
                region(RegionKind::KernelMap, Self::KERNEL_MAP_START, Self::KERNEL_MAP_SIZE),
            ],
        }
    }

    /// Total span of the address space, `[0, end)`.
    pub fn address_space_end(&self) -> VAddr {
        1 << ADDRESS_SPACE_BITS
    }

    pub fn region(&self, kind: RegionKind) -> Region {
        self.regions[kind as usize]
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Region holding the whole of `[addr, addr + size)`, if any.
    pub fn region_of(&self, addr: VAddr, size: u64) -> Option<Region> {
        self.regions.iter().copied().find(|r| r.contains(addr, size))
    }
}
