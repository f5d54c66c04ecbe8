use types::ResultCode;

use super::{ok, ret, SvcCall, SvcOutcome, SvcResult};
use crate::object::{KObject, ObjectKind};
use crate::scheduler::LOWEST_PRIORITY;
use crate::state::KernelState;
use crate::thread::{ThreadState, WaitKind};

/// SleepThread values that yield instead of sleeping.
const YIELD_WITHOUT_MIGRATION: i64 = 0;
const YIELD_WITH_MIGRATION: i64 = -1;
const YIELD_TO_ANY_THREAD: i64 = -2;

/// Core id meaning "the process's ideal core" / "keep the current one".
const IDEAL_CORE_USE_PROCESS: i32 = -2;
const IDEAL_CORE_DONT_CARE: i32 = -3;

pub(super) fn exit_process(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    state.terminate_process(call.process, Some(call.thread));
    Ok(SvcOutcome::Exited)
}

pub(super) fn terminate_process(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let process = state.resolve_as(call.thread, call.handle(0), ObjectKind::Process)?;
    if process == call.process {
        return exit_process(state, call);
    }
    state.terminate_process(process, None);
    ok()
}

pub(super) fn create_thread(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (entry, arg, stack_top) = (call.arg(1), call.arg(2), call.arg(3));
    let priority = call.arg(4) as u32;
    let core = call.arg(5) as i32;
    let thread = state.create_thread(call.process, entry, arg, stack_top, priority, core)?;
    match state.add_handle(call.process, thread) {
        Ok(handle) => ret(&[handle.raw() as u64]),
        Err(rc) => {
            state.exit_thread(thread);
            Err(rc)
        }
    }
}

pub(super) fn start_thread(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let thread = state.resolve_as(call.thread, call.handle(0), ObjectKind::Thread)?;
    state.start_thread(thread)?;
    ok()
}

pub(super) fn exit_thread(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    state.exit_thread(call.thread);
    Ok(SvcOutcome::Exited)
}

pub(super) fn sleep_thread(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    match call.i64(0) {
        YIELD_WITHOUT_MIGRATION | YIELD_WITH_MIGRATION | YIELD_TO_ANY_THREAD => Ok(SvcOutcome::Yield),
        ns if ns < 0 => Ok(SvcOutcome::Yield),
        ns => {
            state.begin_wait(call.thread, WaitKind::Sleep, ns);
            Ok(SvcOutcome::Blocked)
        }
    }
}

pub(super) fn get_thread_priority(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let thread = state.resolve_as(call.thread, call.handle(1), ObjectKind::Thread)?;
    let priority = state.objects.thread(thread).map_or(0, |t| t.priority);
    ret(&[priority as u64])
}

pub(super) fn set_thread_priority(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let thread = state.resolve_as(call.thread, call.handle(0), ObjectKind::Thread)?;
    let priority = call.arg(1);
    let highest = state
        .objects
        .process(call.process)
        .map_or(0, |p| p.highest_priority);
    if priority > LOWEST_PRIORITY as u64 || priority < highest as u64 {
        return Err(ResultCode::INVALID_PRIORITY);
    }
    let priority = priority as u8;
    let t = state.objects.thread_mut(thread).ok_or(ResultCode::INVALID_HANDLE)?;
    t.priority = priority;
    let (thread_state, affinity, wait) = (t.state, t.affinity, t.wait.clone());

    match thread_state {
        ThreadState::Ready => {
            state.scheduler.remove(thread);
            state.scheduler.enqueue(thread, priority, affinity, false);
            state.scheduler.request_preemption(priority, affinity);
        }
        ThreadState::Running => {
            state.scheduler.update_running_priority(thread, priority);
            if let Some(core) = state.scheduler.running_core(thread) {
                if state.scheduler.best_ready_priority(core).map_or(false, |p| p < priority) {
                    state.scheduler.interrupt(thread);
                }
            }
        }
        ThreadState::Waiting => {
            if let Some(WaitKind::Synchronization { objects } | WaitKind::Receive { objects }) = wait {
                for object in objects {
                    match state.objects.get_mut(object) {
                        Some(KObject::ReadableEvent(e)) => e.waiters.update_priority(thread, priority),
                        Some(KObject::Thread(t)) => t.waiters.update_priority(thread, priority),
                        Some(KObject::Process(p)) => p.waiters.update_priority(thread, priority),
                        Some(KObject::ServerPort(p)) => p.waiters.update_priority(thread, priority),
                        Some(KObject::ServerSession(s)) => s.waiters.update_priority(thread, priority),
                        _ => {}
                    }
                }
            }
        }
        ThreadState::Initialized | ThreadState::Terminated => {}
    }
    ok()
}

pub(super) fn get_thread_core_mask(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let thread = state.resolve_as(call.thread, call.handle(2), ObjectKind::Thread)?;
    let t = state.objects.thread(thread).ok_or(ResultCode::INVALID_HANDLE)?;
    ret(&[t.ideal_core as u64, t.affinity])
}

pub(super) fn set_thread_core_mask(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let thread = state.resolve_as(call.thread, call.handle(0), ObjectKind::Thread)?;
    let (core, mask) = (call.arg(1) as i32, call.arg(2));
    let p = state.objects.process(call.process).ok_or(ResultCode::INVALID_HANDLE)?;
    let (process_ideal, process_mask) = (p.ideal_core, p.core_mask);
    let current_ideal = state.objects.thread(thread).map_or(0, |t| t.ideal_core);

    let ideal = match core {
        IDEAL_CORE_USE_PROCESS => process_ideal,
        IDEAL_CORE_DONT_CARE => current_ideal,
        c if c < 0 => return Err(ResultCode::INVALID_CORE_ID),
        c => c as usize,
    };
    if mask == 0 {
        return Err(ResultCode::INVALID_COMBINATION);
    }
    if mask & !process_mask != 0 || mask >> state.scheduler.num_cores() != 0 {
        return Err(ResultCode::INVALID_CORE_ID);
    }
    if ideal >= 64 || mask & (1 << ideal) == 0 {
        return Err(ResultCode::INVALID_COMBINATION);
    }

    let t = state.objects.thread_mut(thread).ok_or(ResultCode::INVALID_HANDLE)?;
    t.ideal_core = ideal;
    t.affinity = mask;
    let (thread_state, priority) = (t.state, t.priority);
    match thread_state {
        ThreadState::Ready => {
            state.scheduler.remove(thread);
            state.scheduler.enqueue(thread, priority, mask, false);
            state.scheduler.request_preemption(priority, mask);
        }
        ThreadState::Running => {
            if let Some(core) = state.scheduler.running_core(thread) {
                if mask & (1 << core) == 0 {
                    state.scheduler.interrupt(thread);
                }
            }
        }
        _ => {}
    }
    ok()
}

pub(super) fn get_process_id(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let object = state.resolve(call.thread, call.handle(1))?;
    let pid = match state.objects.get(object) {
        Some(KObject::Process(p)) => p.pid,
        Some(KObject::Thread(t)) => t.pid,
        _ => return Err(ResultCode::INVALID_HANDLE),
    };
    ret(&[pid])
}

pub(super) fn get_thread_id(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let thread = state.resolve_as(call.thread, call.handle(1), ObjectKind::Thread)?;
    let tid = state.objects.thread(thread).map_or(0, |t| t.tid);
    ret(&[tid])
}
