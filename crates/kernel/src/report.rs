use std::fmt;

use cpu::{HaltReason, ThreadContext};
use types::ResultCode;

/// Why a process was stopped by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    UnknownSvc(u32),
    Fault(HaltReason),
    /// svcBreak without the notification bit.
    Break { reason: u64 },
    /// Reported by a service (fatal:u).
    Service(ResultCode),
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalKind::UnknownSvc(id) => write!(f, "unknown svc 0x{:02X}", id),
            FatalKind::Fault(reason) => write!(f, "{}", reason),
            FatalKind::Break { reason } => write!(f, "break 0x{:x}", reason),
            FatalKind::Service(rc) => write!(f, "fatal error {}", rc),
        }
    }
}

/// Things the host embedding the kernel should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Fatal {
        pid: u64,
        kind: FatalKind,
        registers: Box<ThreadContext>,
    },
    ProcessExited {
        pid: u64,
    },
    DebugOutput {
        pid: u64,
        text: String,
    },
}
