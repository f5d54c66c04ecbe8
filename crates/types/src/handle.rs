use core::fmt;

/// Per-process capability value referring to a kernel object.
///
/// Encoding: `[reserved:2][linear_id:15][index:15]`. The linear id is never
/// zero for a live handle, so `Handle(0)` is always invalid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const INVALID: Handle = Handle(0);
    /// Pseudo handle naming the calling thread.
    pub const CURRENT_THREAD: Handle = Handle(0xFFFF_8000);
    /// Pseudo handle naming the calling process.
    pub const CURRENT_PROCESS: Handle = Handle(0xFFFF_8001);

    pub const INDEX_BITS: u32 = 15;
    pub const LINEAR_ID_BITS: u32 = 15;

    pub const fn from_parts(index: u16, linear_id: u16) -> Self {
        Handle((index as u32 & 0x7FFF) | ((linear_id as u32 & 0x7FFF) << Self::INDEX_BITS))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> u16 {
        (self.0 & 0x7FFF) as u16
    }

    pub const fn linear_id(self) -> u16 {
        ((self.0 >> Self::INDEX_BITS) & 0x7FFF) as u16
    }

    pub const fn reserved(self) -> u32 {
        self.0 >> (Self::INDEX_BITS + Self::LINEAR_ID_BITS)
    }

    pub const fn is_pseudo(self) -> bool {
        self.0 == Self::CURRENT_THREAD.0 || self.0 == Self::CURRENT_PROCESS.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(0x{:08X})", self.0)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Handle(raw)
    }
}
