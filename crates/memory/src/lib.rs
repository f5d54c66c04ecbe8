//! Emulated physical memory and per-process guest address spaces.
//!
//! Layers, leaf first:
//! - [`DeviceMemory`]: the DRAM backing store; physical addresses translate
//!   to host offsets by subtracting [`types::DRAM_BASE`].
//! - [`MemoryManager`]: fixed physical pools handing out reference-counted
//!   [`PageGroup`]s.
//! - [`PageTable`] + [`MemoryBlockManager`]: translation and per-range state.
//! - [`AddressSpace`]: the per-process page table with its region layout.

mod pte;

pub mod address_space;
pub mod block;
pub mod device_memory;
pub mod layout;
pub mod manager;
pub mod observer;
pub mod page_group;
pub mod page_table;

pub use address_space::{AddressSpace, MAX_RANDOM_PLACEMENT_ATTEMPTS};
pub use block::{MemoryBlock, MemoryBlockManager};
pub use device_memory::DeviceMemory;
pub use layout::{AddressSpaceLayout, Region, RegionKind};
pub use manager::{Direction, MemoryManager, Pool, PoolSizes};
pub use observer::MappingObserver;
pub use page_group::{PageBlock, PageGroup};
pub use page_table::PageTable;
pub(crate) use pte::Pte;
