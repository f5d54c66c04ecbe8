use std::sync::RwLock;

use types::{PAddr, ResultCode, DRAM_BASE};

/// Contiguous backing store for emulated DRAM.
///
/// Physical-to-host translation is `paddr - DRAM_BASE`; there is no lookup
/// table. Contents are not synchronized beyond the lock that guards each copy:
/// guests that race on shared memory observe whatever interleaving the host
/// produces, as on hardware.
#[derive(Debug)]
pub struct DeviceMemory {
    backing: RwLock<Vec<u8>>,
    size: u64,
}

impl DeviceMemory {
    pub fn new(size: u64) -> Self {
        assert!(size != 0, "device memory size must be > 0");
        Self {
            backing: RwLock::new(vec![0u8; size as usize]),
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn base(&self) -> PAddr {
        DRAM_BASE
    }

    /// Host offset of `paddr`, if `paddr..paddr+len` lies inside DRAM.
    pub fn offset(&self, paddr: PAddr, len: usize) -> Option<usize> {
        let off = paddr.checked_sub(DRAM_BASE)?;
        let end = off.checked_add(len as u64)?;
        if end > self.size {
            return None;
        }
        Some(off as usize)
    }

    pub fn read(&self, paddr: PAddr, out: &mut [u8]) -> Result<(), ResultCode> {
        let off = self.offset(paddr, out.len()).ok_or(ResultCode::INVALID_ADDRESS)?;
        let backing = self.backing.read().unwrap_or_else(|e| e.into_inner());
        out.copy_from_slice(&backing[off..off + out.len()]);
        Ok(())
    }

    pub fn write(&self, paddr: PAddr, data: &[u8]) -> Result<(), ResultCode> {
        let off = self.offset(paddr, data.len()).ok_or(ResultCode::INVALID_ADDRESS)?;
        let mut backing = self.backing.write().unwrap_or_else(|e| e.into_inner());
        backing[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, paddr: PAddr, len: usize, value: u8) -> Result<(), ResultCode> {
        let off = self.offset(paddr, len).ok_or(ResultCode::INVALID_ADDRESS)?;
        let mut backing = self.backing.write().unwrap_or_else(|e| e.into_inner());
        backing[off..off + len].fill(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_is_an_offset_from_dram_base() {
        let mem = DeviceMemory::new(0x4000);
        assert_eq!(mem.offset(DRAM_BASE, 1), Some(0));
        assert_eq!(mem.offset(DRAM_BASE + 0x1234, 4), Some(0x1234));
        assert_eq!(mem.offset(DRAM_BASE - 1, 1), None);
        assert_eq!(mem.offset(DRAM_BASE + 0x3FFF, 2), None);
    }

    #[test]
    fn read_back_written_bytes() {
        let mem = DeviceMemory::new(0x2000);
        mem.write(DRAM_BASE + 0x10, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        mem.read(DRAM_BASE + 0x10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(
            mem.write(DRAM_BASE + 0x1FFF, &[0, 0]),
            Err(ResultCode::INVALID_ADDRESS)
        );
    }
}
