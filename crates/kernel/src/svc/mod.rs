//! Supervisor call dispatch.
//!
//! Arguments come from x0..x7 of the calling thread's saved context. A
//! handler either answers at once (result code in x0, outputs from x1) or
//! blocks the thread, in which case the wake-up writes the result later.

mod debug;
mod info;
mod ipc;
mod memory;
mod resource;
mod sync;
mod thread;

use log::{debug, error, trace};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use types::{Handle, ResultCode};

use crate::arena::ObjectId;
use crate::report::FatalKind;
use crate::state::KernelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SvcId {
    SetHeapSize = 0x01,
    SetMemoryPermission = 0x02,
    MapMemory = 0x04,
    UnmapMemory = 0x05,
    QueryMemory = 0x06,
    ExitProcess = 0x07,
    CreateThread = 0x08,
    StartThread = 0x09,
    ExitThread = 0x0A,
    SleepThread = 0x0B,
    GetThreadPriority = 0x0C,
    SetThreadPriority = 0x0D,
    GetThreadCoreMask = 0x0E,
    SetThreadCoreMask = 0x0F,
    GetCurrentProcessorNumber = 0x10,
    SignalEvent = 0x11,
    ClearEvent = 0x12,
    MapSharedMemory = 0x13,
    UnmapSharedMemory = 0x14,
    CloseHandle = 0x16,
    ResetSignal = 0x17,
    WaitSynchronization = 0x18,
    CancelSynchronization = 0x19,
    ArbitrateLock = 0x1A,
    ArbitrateUnlock = 0x1B,
    WaitProcessWideKeyAtomic = 0x1C,
    SignalProcessWideKey = 0x1D,
    GetSystemTick = 0x1E,
    ConnectToNamedPort = 0x1F,
    SendSyncRequest = 0x21,
    GetProcessId = 0x24,
    GetThreadId = 0x25,
    Break = 0x26,
    OutputDebugString = 0x27,
    GetInfo = 0x29,
    GetResourceLimitLimitValue = 0x30,
    GetResourceLimitCurrentValue = 0x31,
    WaitForAddress = 0x34,
    SignalToAddress = 0x35,
    CreateSession = 0x40,
    AcceptSession = 0x41,
    ReplyAndReceive = 0x43,
    CreateEvent = 0x45,
    CreateSharedMemory = 0x50,
    ManageNamedPort = 0x71,
    TerminateProcess = 0x7B,
    CreateResourceLimit = 0x7D,
    SetResourceLimitLimitValue = 0x7F,
}

/// How a supervisor call finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvcOutcome {
    /// Success; values go to x1, x2, ...
    Return(Vec<u64>),
    /// Failure that still reports outputs.
    ReturnWith(ResultCode, Vec<u64>),
    /// Values written from x0 with no result code.
    Raw(Vec<u64>),
    /// The thread is waiting; its wake-up supplies the result.
    Blocked,
    /// Give up the rest of the time slice.
    Yield,
    /// The calling thread no longer runs.
    Exited,
}

pub type SvcResult = Result<SvcOutcome, ResultCode>;

pub(crate) fn ok() -> SvcResult {
    Ok(SvcOutcome::Return(Vec::new()))
}

pub(crate) fn ret(values: &[u64]) -> SvcResult {
    Ok(SvcOutcome::Return(values.to_vec()))
}

/// Arguments of one call plus who made it.
pub(crate) struct SvcCall {
    pub thread: ObjectId,
    pub process: ObjectId,
    pub core: usize,
    pub args: [u64; 8],
}

impl SvcCall {
    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }

    pub fn handle(&self, index: usize) -> Handle {
        Handle(self.args[index] as u32)
    }

    pub fn i64(&self, index: usize) -> i64 {
        self.args[index] as i64
    }
}

/// Runs supervisor call `id` for `thread` and stores its outcome in the
/// thread's context. Returns the outcome so the caller can reschedule.
pub fn dispatch(state: &mut KernelState, thread: ObjectId, core: usize, id: u32) -> SvcOutcome {
    let Some(t) = state.objects.thread(thread) else {
        return SvcOutcome::Exited;
    };
    let args = t.context.args();
    let (pid, tid) = (t.pid, t.tid);
    let process = match state.process_of(thread) {
        Ok(process) => process,
        Err(_) => {
            state.exit_thread(thread);
            return SvcOutcome::Exited;
        }
    };
    let call = SvcCall {
        thread,
        process,
        core,
        args,
    };

    let Ok(svc) = SvcId::try_from(id) else {
        error!("process {} thread {}: unimplemented svc 0x{:02X}", pid, tid, id);
        state.report_fatal(thread, FatalKind::UnknownSvc(id));
        return SvcOutcome::Exited;
    };
    trace!("pid {} tid {}: {:?} {:x?}", pid, tid, svc, &args[..4]);

    let result = match svc {
        SvcId::SetHeapSize => memory::set_heap_size(state, &call),
        SvcId::SetMemoryPermission => memory::set_memory_permission(state, &call),
        SvcId::MapMemory => memory::map_memory(state, &call),
        SvcId::UnmapMemory => memory::unmap_memory(state, &call),
        SvcId::QueryMemory => memory::query_memory(state, &call),
        SvcId::MapSharedMemory => memory::map_shared_memory(state, &call),
        SvcId::UnmapSharedMemory => memory::unmap_shared_memory(state, &call),
        SvcId::CreateSharedMemory => memory::create_shared_memory(state, &call),
        SvcId::ExitProcess => thread::exit_process(state, &call),
        SvcId::TerminateProcess => thread::terminate_process(state, &call),
        SvcId::CreateThread => thread::create_thread(state, &call),
        SvcId::StartThread => thread::start_thread(state, &call),
        SvcId::ExitThread => thread::exit_thread(state, &call),
        SvcId::SleepThread => thread::sleep_thread(state, &call),
        SvcId::GetThreadPriority => thread::get_thread_priority(state, &call),
        SvcId::SetThreadPriority => thread::set_thread_priority(state, &call),
        SvcId::GetThreadCoreMask => thread::get_thread_core_mask(state, &call),
        SvcId::SetThreadCoreMask => thread::set_thread_core_mask(state, &call),
        SvcId::GetCurrentProcessorNumber => Ok(SvcOutcome::Raw(vec![call.core as u64])),
        SvcId::GetProcessId => thread::get_process_id(state, &call),
        SvcId::GetThreadId => thread::get_thread_id(state, &call),
        SvcId::SignalEvent => sync::signal_event(state, &call),
        SvcId::ClearEvent => sync::clear_event(state, &call),
        SvcId::CreateEvent => sync::create_event(state, &call),
        SvcId::CloseHandle => sync::close_handle(state, &call),
        SvcId::ResetSignal => sync::reset_signal(state, &call),
        SvcId::WaitSynchronization => sync::wait_synchronization(state, &call),
        SvcId::CancelSynchronization => sync::cancel_synchronization(state, &call),
        SvcId::ArbitrateLock => sync::arbitrate_lock(state, &call),
        SvcId::ArbitrateUnlock => sync::arbitrate_unlock(state, &call),
        SvcId::WaitProcessWideKeyAtomic => sync::wait_process_wide_key(state, &call),
        SvcId::SignalProcessWideKey => sync::signal_process_wide_key(state, &call),
        SvcId::WaitForAddress => sync::wait_for_address(state, &call),
        SvcId::SignalToAddress => sync::signal_to_address(state, &call),
        SvcId::ConnectToNamedPort => ipc::connect_to_named_port(state, &call),
        SvcId::SendSyncRequest => ipc::send_sync_request(state, &call),
        SvcId::CreateSession => ipc::create_session(state, &call),
        SvcId::AcceptSession => ipc::accept_session(state, &call),
        SvcId::ReplyAndReceive => ipc::reply_and_receive(state, &call),
        SvcId::ManageNamedPort => ipc::manage_named_port(state, &call),
        SvcId::GetSystemTick => Ok(SvcOutcome::Raw(vec![info::system_tick(state)])),
        SvcId::GetInfo => info::get_info(state, &call),
        SvcId::Break => debug::break_(state, &call),
        SvcId::OutputDebugString => debug::output_debug_string(state, &call),
        SvcId::GetResourceLimitLimitValue => resource::get_limit_value(state, &call),
        SvcId::GetResourceLimitCurrentValue => resource::get_current_value(state, &call),
        SvcId::CreateResourceLimit => resource::create_resource_limit(state, &call),
        SvcId::SetResourceLimitLimitValue => resource::set_limit_value(state, &call),
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(rc) => {
            debug!("pid {} tid {}: {:?} failed: {}", pid, tid, svc, rc);
            SvcOutcome::ReturnWith(rc, Vec::new())
        }
    };
    write_outcome(state, thread, &outcome);
    outcome
}

fn write_outcome(state: &mut KernelState, thread: ObjectId, outcome: &SvcOutcome) {
    let Some(t) = state.objects.thread_mut(thread) else {
        return;
    };
    let x = &mut t.context.x;
    match outcome {
        SvcOutcome::Return(values) => {
            x[0] = 0;
            x[1..=values.len()].copy_from_slice(values);
        }
        SvcOutcome::ReturnWith(rc, values) => {
            x[0] = rc.raw() as u64;
            x[1..=values.len()].copy_from_slice(values);
        }
        SvcOutcome::Raw(values) => x[..values.len()].copy_from_slice(values),
        SvcOutcome::Blocked | SvcOutcome::Yield | SvcOutcome::Exited => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svc_numbers_decode() {
        assert_eq!(SvcId::try_from(0x21).ok(), Some(SvcId::SendSyncRequest));
        assert_eq!(SvcId::try_from(0x7F).ok(), Some(SvcId::SetResourceLimitLimitValue));
        assert!(SvcId::try_from(0x03).is_err());
        assert_eq!(u32::from(SvcId::ReplyAndReceive), 0x43);
    }
}
