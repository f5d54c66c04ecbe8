use memory::{DeviceMemory, PageGroup};
use types::{MemoryPermission, PAddr, ResultCode, PAGE_SIZE};

/// Physically backed region mappable into several address spaces.
///
/// The object holds one reference on every page for its whole lifetime;
/// each mapping adds its own.
#[derive(Debug)]
pub struct SharedMemory {
    pub group: PageGroup,
    pub size: u64,
    /// Creator process, or `None` when owned by an HLE service.
    pub owner_pid: Option<u64>,
    pub owner_permission: MemoryPermission,
    pub remote_permission: MemoryPermission,
}

impl SharedMemory {
    /// Permission check for MapSharedMemory from process `pid`.
    pub fn check_permission(&self, pid: u64, requested: MemoryPermission) -> Result<(), ResultCode> {
        let allowed = if self.owner_pid == Some(pid) {
            self.owner_permission
        } else {
            self.remote_permission
        };
        if allowed == MemoryPermission::DONT_CARE {
            return if requested.is_user_settable() && !requested.is_empty() {
                Ok(())
            } else {
                Err(ResultCode::INVALID_NEW_MEMORY_PERMISSION)
            };
        }
        if requested != allowed {
            return Err(ResultCode::INVALID_NEW_MEMORY_PERMISSION);
        }
        Ok(())
    }

    /// Splits `[offset, offset + len)` into physical runs that never cross
    /// a page.
    fn chunks(&self, offset: u64, len: usize) -> Result<Vec<(PAddr, usize, usize)>, ResultCode> {
        let end = offset.checked_add(len as u64).ok_or(ResultCode::OUT_OF_RANGE)?;
        if end > self.size {
            return Err(ResultCode::OUT_OF_RANGE);
        }
        let pages: Vec<PAddr> = self.group.pages().collect();
        let mut chunks = Vec::new();
        let mut done = 0usize;
        while done < len {
            let at = offset + done as u64;
            let page = pages[(at / PAGE_SIZE) as usize];
            let within = at % PAGE_SIZE;
            let chunk = ((PAGE_SIZE - within) as usize).min(len - done);
            chunks.push((page + within, done, chunk));
            done += chunk;
        }
        Ok(chunks)
    }

    /// Host-side read, used by services that own the memory.
    pub fn read(&self, device: &DeviceMemory, offset: u64, out: &mut [u8]) -> Result<(), ResultCode> {
        for (paddr, at, len) in self.chunks(offset, out.len())? {
            device.read(paddr, &mut out[at..at + len])?;
        }
        Ok(())
    }

    pub fn write(&self, device: &DeviceMemory, offset: u64, data: &[u8]) -> Result<(), ResultCode> {
        for (paddr, at, len) in self.chunks(offset, data.len())? {
            device.write(paddr, &data[at..at + len])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_and_remote_permissions_differ() {
        let shm = SharedMemory {
            group: PageGroup::new(),
            size: 0x1000,
            owner_pid: Some(1),
            owner_permission: MemoryPermission::READ_WRITE,
            remote_permission: MemoryPermission::READ,
        };
        assert!(shm.check_permission(1, MemoryPermission::READ_WRITE).is_ok());
        assert!(shm.check_permission(2, MemoryPermission::READ_WRITE).is_err());
        assert!(shm.check_permission(2, MemoryPermission::READ).is_ok());
    }

    #[test]
    fn host_access_spans_pages() {
        let device = DeviceMemory::new(0x4000);
        let mut group = PageGroup::new();
        group.add_block(types::DRAM_BASE + 0x3000, 1);
        group.add_block(types::DRAM_BASE + 0x1000, 1);
        let shm = SharedMemory {
            group,
            size: 0x2000,
            owner_pid: None,
            owner_permission: MemoryPermission::READ_WRITE,
            remote_permission: MemoryPermission::READ,
        };
        shm.write(&device, 0xFFE, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        shm.read(&device, 0xFFE, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        let mut head = [0u8; 2];
        device.read(types::DRAM_BASE + 0x1000, &mut head).unwrap();
        assert_eq!(head, [3, 4]);
        assert_eq!(shm.read(&device, 0x1FFF, &mut out), Err(ResultCode::OUT_OF_RANGE));
    }
}
