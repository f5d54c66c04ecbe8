use types::{MemoryPermission, PAddr, VAddr, PAGE_BITS, PAGE_SIZE};

use crate::Pte;

const LEVEL_BITS: u32 = 9;
const ENTRIES: usize = 1 << LEVEL_BITS;
const LEVELS: u32 = 3;

/// Width of the guest virtual address space handled by the table.
pub const ADDRESS_SPACE_BITS: u32 = PAGE_BITS + LEVEL_BITS * LEVELS;

type Table = Box<[Pte; ENTRIES]>;

fn new_table() -> Table {
    Box::new([Pte::default(); ENTRIES])
}

fn index(va: VAddr, level: u32) -> usize {
    // level 0 is the root
    let shift = PAGE_BITS + LEVEL_BITS * (LEVELS - 1 - level);
    ((va >> shift) as usize) & (ENTRIES - 1)
}

/// Three-level software page table over 4 KiB pages.
///
/// - Tables live in host memory in a single pool (`tables[0]` is the root);
///   intermediate entries point at their child by pool index.
/// - Leaf entries map one guest page to one physical page with a permission.
/// - The table does not own frames. Callers pass physical pages in and are
///   responsible for their reference counts.
/// - Intermediate tables are never reclaimed; an emptied table stays in the
///   pool and is reused by the next mapping that walks through it.
#[derive(Debug)]
pub struct PageTable {
    tables: Vec<Table>,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            tables: vec![new_table()],
        }
    }

    pub fn in_range(va: VAddr) -> bool {
        va >> ADDRESS_SPACE_BITS == 0
    }

    fn allocate_table(&mut self) -> usize {
        self.tables.push(new_table());
        self.tables.len() - 1
    }

    fn leaf_mut(&mut self, va: VAddr, create: bool) -> Option<&mut Pte> {
        let mut table = 0usize;
        for level in 0..LEVELS - 1 {
            let idx = index(va, level);
            let next = match self.tables[table][idx].next_table {
                Some(next) => next,
                None if create => {
                    let next = self.allocate_table();
                    let entry = &mut self.tables[table][idx];
                    entry.valid = true;
                    entry.next_table = Some(next);
                    next
                }
                None => return None,
            };
            table = next;
        }
        Some(&mut self.tables[table][index(va, LEVELS - 1)])
    }

    fn leaf(&self, va: VAddr) -> Option<&Pte> {
        let mut table = 0usize;
        for level in 0..LEVELS - 1 {
            table = self.tables[table][index(va, level)].next_table?;
        }
        let pte = &self.tables[table][index(va, LEVELS - 1)];
        pte.is_leaf().then_some(pte)
    }

    /// Maps `num_pages` consecutive guest pages at `va` onto physical pages
    /// starting at `paddr`. Existing leaves are overwritten.
    pub fn map(&mut self, va: VAddr, paddr: PAddr, num_pages: usize, perm: MemoryPermission) {
        for i in 0..num_pages as u64 {
            if let Some(pte) = self.leaf_mut(va + i * PAGE_SIZE, true) {
                *pte = Pte::leaf(paddr + i * PAGE_SIZE, perm);
            }
        }
    }

    /// Clears the leaves covering `num_pages` at `va`.
    pub fn unmap(&mut self, va: VAddr, num_pages: usize) {
        for i in 0..num_pages as u64 {
            if let Some(pte) = self.leaf_mut(va + i * PAGE_SIZE, false) {
                *pte = Pte::default();
            }
        }
    }

    /// Replaces the permission on every mapped leaf in the range.
    pub fn protect(&mut self, va: VAddr, num_pages: usize, perm: MemoryPermission) {
        for i in 0..num_pages as u64 {
            if let Some(pte) = self.leaf_mut(va + i * PAGE_SIZE, false) {
                if pte.valid {
                    pte.perm = perm;
                }
            }
        }
    }

    /// Physical address backing `va` and the page's permission.
    pub fn translate(&self, va: VAddr) -> Option<(PAddr, MemoryPermission)> {
        if !Self::in_range(va) {
            return None;
        }
        let pte = self.leaf(va)?;
        Some((pte.paddr + (va & (PAGE_SIZE - 1)), pte.perm))
    }

    pub fn is_mapped(&self, va: VAddr) -> bool {
        self.translate(va).is_some()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}
