use types::{MemoryPermission, PAddr};

/// Entry in the software page table.
///
/// Intermediate entries carry `next_table`, an index into the owning
/// [`PageTable`](crate::PageTable)'s table pool; leaf entries carry `paddr`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pte {
    pub valid: bool,
    pub perm: MemoryPermission,
    pub paddr: PAddr,
    pub next_table: Option<usize>,
}

impl Pte {
    pub fn is_leaf(&self) -> bool {
        self.valid && self.next_table.is_none()
    }

    pub fn leaf(paddr: PAddr, perm: MemoryPermission) -> Self {
        Self {
            valid: true,
            perm,
            paddr,
            next_table: None,
        }
    }
}
