use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{SerializeField, VAddr};

bitflags::bitflags! {
    /// Guest-visible page permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryPermission: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const DONT_CARE = 1 << 28;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl MemoryPermission {
    /// Permissions a guest may request through SetMemoryPermission / MapSharedMemory.
    pub fn is_user_settable(self) -> bool {
        self == MemoryPermission::empty()
            || self == MemoryPermission::READ
            || self == MemoryPermission::READ_WRITE
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryAttribute: u32 {
        const LOCKED = 1 << 0;
        const IPC_LOCKED = 1 << 1;
        const DEVICE_SHARED = 1 << 2;
        const UNCACHED = 1 << 3;
    }
}

/// What a range of guest memory is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum MemoryState {
    Free = 0x00,
    Io = 0x01,
    Static = 0x02,
    Code = 0x03,
    CodeData = 0x04,
    Normal = 0x05,
    Shared = 0x06,
    Alias = 0x07,
    AliasCode = 0x08,
    AliasCodeData = 0x09,
    Ipc = 0x0A,
    Stack = 0x0B,
    ThreadLocal = 0x0C,
    Transferred = 0x0D,
    SharedTransferred = 0x0E,
    SharedCode = 0x0F,
    Inaccessible = 0x10,
    NonSecureIpc = 0x11,
    NonDeviceIpc = 0x12,
    Kernel = 0x13,
}

impl Default for MemoryState {
    fn default() -> Self {
        MemoryState::Free
    }
}

impl MemoryState {
    /// States whose permissions a guest may change with SetMemoryPermission.
    pub fn can_reprotect(self) -> bool {
        matches!(self, MemoryState::Normal | MemoryState::CodeData | MemoryState::AliasCodeData)
    }

    /// States that may be the source of MapMemory (stack aliasing).
    pub fn can_alias(self) -> bool {
        matches!(self, MemoryState::Normal)
    }
}

/// Result of QueryMemory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub base_address: VAddr,
    pub size: u64,
    pub state: MemoryState,
    pub attribute: MemoryAttribute,
    pub permission: MemoryPermission,
    pub ipc_ref_count: u32,
    pub device_ref_count: u32,
}

impl MemoryInfo {
    pub const GUEST_SIZE: usize = 0x28;

    /// Guest layout written by QueryMemory.
    pub fn to_guest_bytes(&self) -> [u8; Self::GUEST_SIZE] {
        let mut buf = [0u8; Self::GUEST_SIZE];
        let mut offset = 0;
        self.base_address.serialize_field(&mut buf, &mut offset);
        self.size.serialize_field(&mut buf, &mut offset);
        u32::from(self.state).serialize_field(&mut buf, &mut offset);
        self.attribute.bits().serialize_field(&mut buf, &mut offset);
        self.permission.bits().serialize_field(&mut buf, &mut offset);
        self.ipc_ref_count.serialize_field(&mut buf, &mut offset);
        self.device_ref_count.serialize_field(&mut buf, &mut offset);
        buf
    }

    pub fn end_address(&self) -> VAddr {
        self.base_address + self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_info_guest_layout() {
        let info = MemoryInfo {
            base_address: 0x1234_5000,
            size: 0x2000,
            state: MemoryState::Normal,
            attribute: MemoryAttribute::empty(),
            permission: MemoryPermission::READ_WRITE,
            ipc_ref_count: 0,
            device_ref_count: 0,
        };
        let bytes = info.to_guest_bytes();
        assert_eq!(&bytes[0..8], &0x1234_5000u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x2000u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &5u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &3u32.to_le_bytes());
    }

    #[test]
    fn memory_state_decodes_raw() {
        assert_eq!(MemoryState::try_from(0x0C).ok(), Some(MemoryState::ThreadLocal));
        assert!(MemoryState::try_from(0x99).is_err());
    }
}
