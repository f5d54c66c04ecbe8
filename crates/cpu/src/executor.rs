use std::fmt;
use std::sync::Arc;

use types::{ResultCode, VAddr};

use crate::context::ThreadContext;
use crate::halt::HaltSignal;

/// Why [`Executor::execute`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// `svc #imm`; the number is available from [`Executor::svc_number`].
    SupervisorCall,
    /// The core's [`HaltSignal`] was raised or the time slice ran out.
    BreakLoop,
    DataAbort { addr: VAddr },
    PrefetchAbort { addr: VAddr },
    UndefinedInstruction { pc: VAddr },
    Breakpoint { pc: VAddr },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::SupervisorCall => write!(f, "supervisor call"),
            HaltReason::BreakLoop => write!(f, "break loop"),
            HaltReason::DataAbort { addr } => write!(f, "data abort at 0x{:x}", addr),
            HaltReason::PrefetchAbort { addr } => write!(f, "prefetch abort at 0x{:x}", addr),
            HaltReason::UndefinedInstruction { pc } => {
                write!(f, "undefined instruction at 0x{:x}", pc)
            }
            HaltReason::Breakpoint { pc } => write!(f, "breakpoint at 0x{:x}", pc),
        }
    }
}

/// Guest memory as the executor sees it: the address space of whichever
/// process is loaded on the core.
pub trait GuestMemory: Send + Sync {
    fn read(&self, addr: VAddr, out: &mut [u8]) -> Result<(), ResultCode>;
    fn write(&self, addr: VAddr, data: &[u8]) -> Result<(), ResultCode>;
}

/// Opaque instruction-execution capability for one emulated core.
pub trait Executor: Send {
    /// Runs guest code from the loaded context until something traps.
    fn execute(&mut self) -> HaltReason;

    fn get_reg(&self, index: usize) -> u64;
    fn set_reg(&mut self, index: usize, value: u64);
    fn get_pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    fn get_fpcr(&self) -> u32;
    fn set_fpcr(&mut self, value: u32);

    /// Immediate of the last `svc` instruction.
    fn svc_number(&self) -> u32;

    /// Drops translated code covering the range.
    fn invalidate_cache_range(&mut self, addr: VAddr, size: u64);

    /// Switches the memory view to another process.
    fn set_memory(&mut self, memory: Arc<dyn GuestMemory>);

    fn load_context(&mut self, ctx: &ThreadContext);
    fn save_context(&self, ctx: &mut ThreadContext);
}

/// Builds one executor per emulated core.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, core: usize, halt: HaltSignal) -> Box<dyn Executor>;
}
