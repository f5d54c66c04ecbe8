/// Guest virtual address.
pub type VAddr = u64;
/// Guest physical address.
pub type PAddr = u64;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Physical address of the first byte of emulated DRAM.
pub const DRAM_BASE: PAddr = 0x8000_0000;

pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}
