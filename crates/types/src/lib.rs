//! Vocabulary shared by every layer of the HLE core: result codes, handles,
//! guest memory enums and the little-endian field serializer used to build
//! guest-visible structures.

pub mod address;
pub use address::{align_down, align_up, is_aligned, PAddr, VAddr, DRAM_BASE, PAGE_BITS, PAGE_SIZE};

pub mod result;
pub use result::{ErrorModule, ResultCode};

pub mod handle;
pub use handle::Handle;

pub mod memory;
pub use memory::{MemoryAttribute, MemoryInfo, MemoryPermission, MemoryState};

pub mod primitives;

// used for serialization
pub trait SerializeField {
    /// Appends `self` into `buf` at `*offset`, advancing the offset.
    fn serialize_field(&self, buf: &mut [u8], offset: &mut usize);
}
