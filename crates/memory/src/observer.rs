use types::{MemoryPermission, MemoryState, ResultCode, VAddr};

/// Receives every change made to a guest address space.
///
/// Used to mirror CPU mappings into the video memory manager and to drop
/// stale translated code on unmap. A failing `on_map` makes the address
/// space roll the mapping back and return the observer's result.
pub trait MappingObserver: Send + Sync {
    fn on_map(
        &self,
        _asid: u64,
        _addr: VAddr,
        _size: u64,
        _state: MemoryState,
        _perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        Ok(())
    }

    fn on_unmap(&self, _asid: u64, _addr: VAddr, _size: u64) {}

    fn on_protect(&self, _asid: u64, _addr: VAddr, _size: u64, _perm: MemoryPermission) {}
}
