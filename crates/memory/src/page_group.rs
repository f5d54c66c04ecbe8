use types::{PAddr, PAGE_SIZE};

/// One physically contiguous extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBlock {
    pub address: PAddr,
    pub num_pages: usize,
}

impl PageBlock {
    pub fn size(&self) -> u64 {
        self.num_pages as u64 * PAGE_SIZE
    }

    pub fn end(&self) -> PAddr {
        self.address + self.size()
    }
}

/// A logical allocation described as a list of physical extents.
///
/// Holding a `PageGroup` does not by itself keep pages alive; reference
/// counts live in the [`MemoryManager`](crate::MemoryManager).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageGroup {
    blocks: Vec<PageBlock>,
}

impl PageGroup {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Appends an extent, merging it into the previous one when contiguous.
    pub fn add_block(&mut self, address: PAddr, num_pages: usize) {
        if num_pages == 0 {
            return;
        }
        if let Some(last) = self.blocks.last_mut() {
            if last.end() == address {
                last.num_pages += num_pages;
                return;
            }
        }
        self.blocks.push(PageBlock { address, num_pages });
    }

    pub fn blocks(&self) -> &[PageBlock] {
        &self.blocks
    }

    pub fn num_pages(&self) -> usize {
        self.blocks.iter().map(|b| b.num_pages).sum()
    }

    pub fn size(&self) -> u64 {
        self.num_pages() as u64 * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Physical address of every page, in order.
    pub fn pages(&self) -> impl Iterator<Item = PAddr> + '_ {
        self.blocks
            .iter()
            .flat_map(|b| (0..b.num_pages as u64).map(move |i| b.address + i * PAGE_SIZE))
    }

    /// True when both groups cover the same pages in the same order.
    pub fn is_equivalent_to(&self, other: &PageGroup) -> bool {
        self.pages().eq(other.pages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_blocks_coalesce() {
        let mut pg = PageGroup::new();
        pg.add_block(0x8000_0000, 2);
        pg.add_block(0x8000_2000, 1);
        pg.add_block(0x8001_0000, 1);
        assert_eq!(pg.blocks().len(), 2);
        assert_eq!(pg.num_pages(), 4);
        assert_eq!(pg.blocks()[0].num_pages, 3);
    }

    #[test]
    fn equivalence_ignores_block_split() {
        let mut a = PageGroup::new();
        a.add_block(0x8000_0000, 2);
        let mut b = PageGroup::new();
        b.blocks.push(PageBlock { address: 0x8000_0000, num_pages: 1 });
        b.blocks.push(PageBlock { address: 0x8000_1000, num_pages: 1 });
        assert!(a.is_equivalent_to(&b));
    }
}
