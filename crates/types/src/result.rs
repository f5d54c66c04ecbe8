use core::fmt;

/// Subsystem that produced a failing [`ResultCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorModule {
    Common = 0,
    Kernel = 1,
    Fs = 2,
    Os = 3,
    Loader = 9,
    Cmif = 10,
    Hipc = 11,
    Pm = 15,
    Ns = 16,
    Sm = 21,
    Ro = 22,
    Vi = 114,
    Time = 116,
    Account = 124,
    Am = 128,
    Audio = 153,
    Fatal = 163,
    Hid = 202,
}

/// Guest-visible result value.
///
/// Layout is the firmware one: bits 0..9 carry the module, bits 9..22 the
/// description. Zero is success.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ResultCode(u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);

    pub const OUT_OF_SESSIONS: ResultCode = Self::kernel(7);
    pub const INVALID_ARGUMENT: ResultCode = Self::kernel(14);
    pub const NOT_IMPLEMENTED: ResultCode = Self::kernel(33);
    pub const NO_SYNCHRONIZATION_OBJECT: ResultCode = Self::kernel(57);
    pub const TERMINATION_REQUESTED: ResultCode = Self::kernel(59);
    pub const INVALID_SIZE: ResultCode = Self::kernel(101);
    pub const INVALID_ADDRESS: ResultCode = Self::kernel(102);
    pub const OUT_OF_RESOURCE: ResultCode = Self::kernel(103);
    pub const OUT_OF_MEMORY: ResultCode = Self::kernel(104);
    pub const OUT_OF_HANDLES: ResultCode = Self::kernel(105);
    pub const INVALID_CURRENT_MEMORY: ResultCode = Self::kernel(106);
    pub const INVALID_NEW_MEMORY_PERMISSION: ResultCode = Self::kernel(108);
    pub const INVALID_MEMORY_REGION: ResultCode = Self::kernel(110);
    pub const INVALID_PRIORITY: ResultCode = Self::kernel(112);
    pub const INVALID_CORE_ID: ResultCode = Self::kernel(113);
    pub const INVALID_HANDLE: ResultCode = Self::kernel(114);
    pub const INVALID_POINTER: ResultCode = Self::kernel(115);
    pub const INVALID_COMBINATION: ResultCode = Self::kernel(116);
    pub const TIMED_OUT: ResultCode = Self::kernel(117);
    pub const CANCELLED: ResultCode = Self::kernel(118);
    pub const OUT_OF_RANGE: ResultCode = Self::kernel(119);
    pub const INVALID_ENUM_VALUE: ResultCode = Self::kernel(120);
    pub const NOT_FOUND: ResultCode = Self::kernel(121);
    pub const BUSY: ResultCode = Self::kernel(122);
    pub const SESSION_CLOSED: ResultCode = Self::kernel(123);
    pub const NOT_HANDLED: ResultCode = Self::kernel(124);
    pub const INVALID_STATE: ResultCode = Self::kernel(125);
    pub const RESERVED_USED: ResultCode = Self::kernel(126);
    pub const NOT_SUPPORTED: ResultCode = Self::kernel(127);
    pub const PORT_CLOSED: ResultCode = Self::kernel(131);
    pub const LIMIT_REACHED: ResultCode = Self::kernel(132);
    pub const INVALID_MEMORY_POOL: ResultCode = Self::kernel(133);
    pub const RECEIVE_LIST_BROKEN: ResultCode = Self::kernel(258);
    pub const OUT_OF_ADDRESS_SPACE: ResultCode = Self::kernel(259);
    pub const MESSAGE_TOO_LARGE: ResultCode = Self::kernel(260);
    pub const INVALID_PROCESS_ID: ResultCode = Self::kernel(517);
    pub const INVALID_THREAD_ID: ResultCode = Self::kernel(518);
    pub const PROCESS_TERMINATED: ResultCode = Self::kernel(520);

    pub const fn new(module: ErrorModule, description: u32) -> Self {
        ResultCode((module as u32) | ((description & 0x1FFF) << 9))
    }

    const fn kernel(description: u32) -> Self {
        Self::new(ErrorModule::Kernel, description)
    }

    pub const fn from_raw(raw: u32) -> Self {
        ResultCode(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn module(self) -> u32 {
        self.0 & 0x1FF
    }

    pub const fn description(self) -> u32 {
        (self.0 >> 9) & 0x1FFF
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    pub const fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Converts into `Ok(())` for success so `?` can be used on raw codes.
    pub fn into_result(self) -> Result<(), ResultCode> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResultCode(0x{:08X}, {:04}-{:04})",
            self.0,
            2000 + self.module(),
            self.description()
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:04}", 2000 + self.module(), self.description())
    }
}

impl std::error::Error for ResultCode {}

impl From<ResultCode> for u64 {
    fn from(rc: ResultCode) -> u64 {
        rc.0 as u64
    }
}

/// Service-manager results.
pub mod sm {
    use super::{ErrorModule, ResultCode};

    pub const INVALID_CLIENT: ResultCode = ResultCode::new(ErrorModule::Sm, 2);
    pub const ALREADY_REGISTERED: ResultCode = ResultCode::new(ErrorModule::Sm, 4);
    pub const INVALID_SERVICE_NAME: ResultCode = ResultCode::new(ErrorModule::Sm, 6);
    pub const NOT_REGISTERED: ResultCode = ResultCode::new(ErrorModule::Sm, 7);
}

/// Command-interface framework results.
pub mod cmif {
    use super::{ErrorModule, ResultCode};

    pub const INVALID_HEADER: ResultCode = ResultCode::new(ErrorModule::Cmif, 202);
    pub const UNKNOWN_COMMAND_ID: ResultCode = ResultCode::new(ErrorModule::Cmif, 221);
    pub const INVALID_IN_OBJECT_COUNT: ResultCode = ResultCode::new(ErrorModule::Cmif, 232);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_firmware_values() {
        assert_eq!(ResultCode::INVALID_HANDLE.raw(), 0xE401);
        assert_eq!(ResultCode::TIMED_OUT.raw(), 0xEA01);
        assert_eq!(ResultCode::OUT_OF_MEMORY.raw(), 0xD001);
        assert_eq!(cmif::UNKNOWN_COMMAND_ID.raw(), 0x1BA0A);
        assert_eq!(ResultCode::INVALID_HANDLE.module(), 1);
        assert_eq!(ResultCode::INVALID_HANDLE.description(), 114);
    }

    #[test]
    fn into_result_maps_success() {
        assert!(ResultCode::SUCCESS.into_result().is_ok());
        assert_eq!(ResultCode::BUSY.into_result(), Err(ResultCode::BUSY));
        assert_eq!(format!("{}", ResultCode::INVALID_HANDLE), "2001-0114");
    }
}
