use types::{is_aligned, Handle, ResultCode, VAddr};

use super::{ok, ret, SvcCall, SvcOutcome, SvcResult};
use crate::arena::ObjectId;
use crate::event::{ReadableEvent, WritableEvent};
use crate::object::{KObject, ObjectKind};
use crate::process::{AddressWaiter, ConditionWaiter};
use crate::resource_limit::LimitableResource;
use crate::state::KernelState;
use crate::thread::{ThreadState, WaitKind};

/// Set in a mutex word while other threads wait for it.
pub(crate) const MUTEX_HAS_WAITERS: u32 = 0x4000_0000;

const MAX_WAIT_OBJECTS: u64 = 64;

fn readable_of(state: &KernelState, call: &SvcCall, handle: Handle) -> Result<ObjectId, ResultCode> {
    let id = state.resolve(call.thread, handle)?;
    match state.objects.get(id) {
        Some(KObject::ReadableEvent(_)) => Ok(id),
        Some(KObject::WritableEvent(w)) => Ok(w.readable),
        _ => Err(ResultCode::INVALID_HANDLE),
    }
}

pub(super) fn signal_event(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let writable = state.resolve_as(call.thread, call.handle(0), ObjectKind::WritableEvent)?;
    let readable = state
        .objects
        .writable_event(writable)
        .map(|w| w.readable)
        .ok_or(ResultCode::INVALID_HANDLE)?;
    if let Some(e) = state.objects.readable_event_mut(readable) {
        e.signaled = true;
    }
    state.signal_object(readable);
    ok()
}

pub(super) fn clear_event(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let readable = readable_of(state, call, call.handle(0))?;
    if let Some(e) = state.objects.readable_event_mut(readable) {
        e.signaled = false;
    }
    ok()
}

pub(super) fn create_event(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let limit = state
        .objects
        .process(call.process)
        .map(|p| p.resource_limit)
        .ok_or(ResultCode::INVALID_HANDLE)?;
    let reserved = state
        .objects
        .resource_limit_mut(limit)
        .map_or(false, |l| l.reserve(LimitableResource::Events, 1));
    if !reserved {
        return Err(ResultCode::LIMIT_REACHED);
    }
    state.objects.open(limit);

    let readable = state.objects.insert(KObject::ReadableEvent(ReadableEvent::default()));
    let writable = state.objects.insert(KObject::WritableEvent(WritableEvent {
        readable,
        limit: Some(limit),
    }));
    let write_handle = state.add_new_handle(call.process, writable)?;
    match state.add_handle(call.process, readable) {
        Ok(read_handle) => ret(&[write_handle.raw() as u64, read_handle.raw() as u64]),
        Err(rc) => {
            let _ = state.close_handle(call.process, write_handle);
            Err(rc)
        }
    }
}

pub(super) fn close_handle(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    state.close_handle(call.process, call.handle(0))?;
    ok()
}

pub(super) fn reset_signal(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let id = state.resolve(call.thread, call.handle(0))?;
    let signaled = match state.objects.get_mut(id) {
        Some(KObject::ReadableEvent(e)) => &mut e.signaled,
        Some(KObject::Process(p)) => &mut p.signaled,
        _ => return Err(ResultCode::INVALID_HANDLE),
    };
    if !*signaled {
        return Err(ResultCode::INVALID_STATE);
    }
    *signaled = false;
    ok()
}

pub(super) fn wait_synchronization(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (ptr, count, timeout) = (call.arg(1), call.arg(2), call.i64(3));
    if count > MAX_WAIT_OBJECTS {
        return Err(ResultCode::OUT_OF_RANGE);
    }
    let raw = state
        .read_guest(call.process, ptr, count as usize * 4)
        .map_err(|_| ResultCode::INVALID_POINTER)?;
    let mut objects = Vec::with_capacity(count as usize);
    for chunk in raw.chunks_exact(4) {
        let handle = Handle(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        let id = state.resolve(call.thread, handle)?;
        if state.is_signaled(id).is_none() {
            return Err(ResultCode::INVALID_HANDLE);
        }
        objects.push(id);
    }

    if let Some(t) = state.objects.thread_mut(call.thread) {
        if std::mem::take(&mut t.cancel_pending) {
            return Err(ResultCode::CANCELLED);
        }
    }
    if let Some(index) = objects.iter().position(|&o| state.is_signaled(o) == Some(true)) {
        return ret(&[index as u64]);
    }
    if timeout == 0 {
        return Err(ResultCode::TIMED_OUT);
    }
    state.wait_on_objects(call.thread, WaitKind::Synchronization { objects }, timeout);
    Ok(SvcOutcome::Blocked)
}

pub(super) fn cancel_synchronization(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let thread = state.resolve_as(call.thread, call.handle(0), ObjectKind::Thread)?;
    let t = state.objects.thread_mut(thread).ok_or(ResultCode::INVALID_HANDLE)?;
    let waiting = t.state == ThreadState::Waiting
        && matches!(t.wait, Some(WaitKind::Synchronization { .. } | WaitKind::Receive { .. }));
    if waiting {
        state.end_wait(thread, ResultCode::CANCELLED, &[]);
    } else {
        t.cancel_pending = true;
    }
    ok()
}

fn check_word_address(addr: VAddr) -> Result<(), ResultCode> {
    if addr == 0 {
        return Err(ResultCode::INVALID_POINTER);
    }
    if !is_aligned(addr, 4) {
        return Err(ResultCode::INVALID_ADDRESS);
    }
    Ok(())
}

pub(super) fn arbitrate_lock(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (owner_handle, addr, tag) = (call.handle(0), call.arg(1), Handle(call.arg(2) as u32));
    check_word_address(addr)?;
    let value = state
        .read_guest_u32(call.process, addr)
        .map_err(|_| ResultCode::INVALID_CURRENT_MEMORY)?;
    if value != owner_handle.raw() | MUTEX_HAS_WAITERS {
        return ok();
    }
    let owner = state.resolve_as(call.thread, owner_handle, ObjectKind::Thread)?;
    if owner == call.thread {
        return Err(ResultCode::INVALID_HANDLE);
    }
    if let Some(o) = state.objects.thread_mut(owner) {
        o.mutex_waiters.push(call.thread);
    }
    if let Some(t) = state.objects.thread_mut(call.thread) {
        t.mutex_tag = tag;
    }
    state.begin_wait(call.thread, WaitKind::Mutex { addr, owner }, -1);
    Ok(SvcOutcome::Blocked)
}

/// Hands the mutex at `addr` held by `owner` to its most urgent waiter and
/// rewrites the mutex word.
fn release_mutex(state: &mut KernelState, process: ObjectId, owner: ObjectId, addr: VAddr) -> Result<(), ResultCode> {
    let mut contenders: Vec<(u8, usize, ObjectId)> = Vec::new();
    if let Some(o) = state.objects.thread(owner) {
        for (order, &waiter) in o.mutex_waiters.iter().enumerate() {
            let Some(w) = state.objects.thread(waiter) else {
                continue;
            };
            if matches!(w.wait, Some(WaitKind::Mutex { addr: a, .. }) if a == addr) {
                contenders.push((w.priority, order, waiter));
            }
        }
    }
    contenders.sort();
    let Some(&(_, _, next)) = contenders.first() else {
        state
            .write_guest_u32(process, addr, 0)
            .map_err(|_| ResultCode::INVALID_CURRENT_MEMORY)?;
        return Ok(());
    };

    let rest: Vec<ObjectId> = contenders[1..].iter().map(|&(_, _, t)| t).collect();
    if let Some(o) = state.objects.thread_mut(owner) {
        o.mutex_waiters.retain(|w| *w != next && !rest.contains(w));
    }
    for &waiter in &rest {
        if let Some(w) = state.objects.thread_mut(waiter) {
            w.wait = Some(WaitKind::Mutex { addr, owner: next });
        }
    }
    let tag = match state.objects.thread_mut(next) {
        Some(n) => {
            n.mutex_waiters.extend(rest.iter().copied());
            n.mutex_tag
        }
        None => Handle::INVALID,
    };
    let value = if rest.is_empty() {
        tag.raw()
    } else {
        tag.raw() | MUTEX_HAS_WAITERS
    };
    let result = state
        .write_guest_u32(process, addr, value)
        .map_err(|_| ResultCode::INVALID_CURRENT_MEMORY);
    state.end_wait(next, result.err().unwrap_or(ResultCode::SUCCESS), &[]);
    result
}

pub(super) fn arbitrate_unlock(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let addr = call.arg(0);
    check_word_address(addr)?;
    release_mutex(state, call.process, call.thread, addr)?;
    ok()
}

pub(super) fn wait_process_wide_key(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (mutex, key, tag, timeout) = (call.arg(0), call.arg(1), Handle(call.arg(2) as u32), call.i64(3));
    check_word_address(mutex)?;
    release_mutex(state, call.process, call.thread, mutex)?;
    if timeout == 0 {
        return Err(ResultCode::TIMED_OUT);
    }
    let seq = state.seq();
    let priority = state.objects.thread(call.thread).map_or(0, |t| t.priority);
    if let Some(t) = state.objects.thread_mut(call.thread) {
        t.mutex_tag = tag;
    }
    if let Some(p) = state.objects.process_mut(call.process) {
        p.condition_waiters.push(ConditionWaiter {
            key,
            mutex,
            thread: call.thread,
            priority,
            seq,
        });
    }
    let _ = state.write_guest_u32(call.process, key, 1);
    state.begin_wait(call.thread, WaitKind::ConditionVariable { key, mutex }, timeout);
    Ok(SvcOutcome::Blocked)
}

/// Moves a woken condition waiter onto its mutex: it either takes the
/// mutex at once or queues behind the current owner.
fn acquire_for(state: &mut KernelState, process: ObjectId, waiter: ConditionWaiter) {
    let thread = waiter.thread;
    let tag = state.objects.thread(thread).map_or(Handle::INVALID, |t| t.mutex_tag);
    let value = match state.read_guest_u32(process, waiter.mutex) {
        Ok(value) => value,
        Err(_) => {
            state.end_wait(thread, ResultCode::INVALID_CURRENT_MEMORY, &[]);
            return;
        }
    };
    if value == 0 {
        let rc = state
            .write_guest_u32(process, waiter.mutex, tag.raw())
            .err()
            .map_or(ResultCode::SUCCESS, |_| ResultCode::INVALID_CURRENT_MEMORY);
        state.end_wait(thread, rc, &[]);
        return;
    }

    let owner_handle = Handle(value & !MUTEX_HAS_WAITERS);
    let owner = match state.resolve_as(thread, owner_handle, ObjectKind::Thread) {
        Ok(owner) => owner,
        Err(rc) => {
            state.end_wait(thread, rc, &[]);
            return;
        }
    };
    if state.write_guest_u32(process, waiter.mutex, value | MUTEX_HAS_WAITERS).is_err() {
        state.end_wait(thread, ResultCode::INVALID_CURRENT_MEMORY, &[]);
        return;
    }
    if let Some(o) = state.objects.thread_mut(owner) {
        o.mutex_waiters.push(thread);
    }
    if let Some(t) = state.objects.thread_mut(thread) {
        t.wait = Some(WaitKind::Mutex {
            addr: waiter.mutex,
            owner,
        });
        if let Some(key) = t.timer.take() {
            state.timers.cancel(key);
        }
    }
}

pub(super) fn signal_process_wide_key(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (key, count) = (call.arg(0), call.arg(1) as i32);
    let p = state.objects.process_mut(call.process).ok_or(ResultCode::INVALID_HANDLE)?;
    let mut matching: Vec<ConditionWaiter> = p
        .condition_waiters
        .iter()
        .filter(|w| w.key == key)
        .copied()
        .collect();
    matching.sort_by_key(|w| (w.priority, w.seq));
    let take = if count <= 0 {
        matching.len()
    } else {
        matching.len().min(count as usize)
    };
    let woken: Vec<ConditionWaiter> = matching.drain(..take).collect();
    p.condition_waiters
        .retain(|w| !woken.iter().any(|x| x.thread == w.thread));

    for waiter in woken {
        acquire_for(state, call.process, waiter);
    }
    if matching.is_empty() {
        let _ = state.write_guest_u32(call.process, key, 0);
    }
    ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArbitrationType {
    WaitIfLessThan,
    DecrementAndWaitIfLessThan,
    WaitIfEqual,
}

impl TryFrom<u64> for ArbitrationType {
    type Error = ResultCode;

    fn try_from(raw: u64) -> Result<Self, ResultCode> {
        match raw {
            0 => Ok(Self::WaitIfLessThan),
            1 => Ok(Self::DecrementAndWaitIfLessThan),
            2 => Ok(Self::WaitIfEqual),
            _ => Err(ResultCode::INVALID_ENUM_VALUE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalType {
    Signal,
    SignalAndIncrementIfEqual,
    SignalAndModifyByWaiterCountIfEqual,
}

impl TryFrom<u64> for SignalType {
    type Error = ResultCode;

    fn try_from(raw: u64) -> Result<Self, ResultCode> {
        match raw {
            0 => Ok(Self::Signal),
            1 => Ok(Self::SignalAndIncrementIfEqual),
            2 => Ok(Self::SignalAndModifyByWaiterCountIfEqual),
            _ => Err(ResultCode::INVALID_ENUM_VALUE),
        }
    }
}

pub(super) fn wait_for_address(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (addr, value, timeout) = (call.arg(0), call.arg(2) as i32, call.i64(3));
    let kind = ArbitrationType::try_from(call.arg(1))?;
    check_word_address(addr)?;
    let current = state
        .read_guest_u32(call.process, addr)
        .map_err(|_| ResultCode::INVALID_CURRENT_MEMORY)? as i32;

    let wait = match kind {
        ArbitrationType::WaitIfLessThan => current < value,
        ArbitrationType::DecrementAndWaitIfLessThan => {
            if current < value {
                state
                    .write_guest_u32(call.process, addr, current.wrapping_sub(1) as u32)
                    .map_err(|_| ResultCode::INVALID_CURRENT_MEMORY)?;
                true
            } else {
                false
            }
        }
        ArbitrationType::WaitIfEqual => current == value,
    };
    if !wait {
        return Err(ResultCode::INVALID_STATE);
    }
    if timeout == 0 {
        return Err(ResultCode::TIMED_OUT);
    }

    let seq = state.seq();
    let priority = state.objects.thread(call.thread).map_or(0, |t| t.priority);
    if let Some(p) = state.objects.process_mut(call.process) {
        p.address_waiters.push(AddressWaiter {
            addr,
            thread: call.thread,
            priority,
            seq,
        });
    }
    state.begin_wait(call.thread, WaitKind::Address { addr }, timeout);
    Ok(SvcOutcome::Blocked)
}

fn address_waiters(state: &KernelState, process: ObjectId, addr: VAddr) -> Vec<AddressWaiter> {
    let mut waiters: Vec<AddressWaiter> = state
        .objects
        .process(process)
        .map(|p| p.address_waiters.iter().filter(|w| w.addr == addr).copied().collect())
        .unwrap_or_default();
    waiters.sort_by_key(|w| (w.priority, w.seq));
    waiters
}

pub(super) fn signal_to_address(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (addr, value, count) = (call.arg(0), call.arg(2) as i32, call.arg(3) as i32);
    let kind = SignalType::try_from(call.arg(1))?;
    check_word_address(addr)?;
    let waiters = address_waiters(state, call.process, addr);

    if kind != SignalType::Signal {
        let current = state
            .read_guest_u32(call.process, addr)
            .map_err(|_| ResultCode::INVALID_CURRENT_MEMORY)? as i32;
        if current != value {
            return Err(ResultCode::INVALID_STATE);
        }
        let new_value = match kind {
            SignalType::SignalAndModifyByWaiterCountIfEqual => {
                if waiters.is_empty() {
                    value.wrapping_add(1)
                } else if count <= 0 {
                    value.wrapping_sub(2)
                } else if waiters.len() <= count as usize {
                    value.wrapping_sub(1)
                } else {
                    value
                }
            }
            _ => value.wrapping_add(1),
        };
        state
            .write_guest_u32(call.process, addr, new_value as u32)
            .map_err(|_| ResultCode::INVALID_CURRENT_MEMORY)?;
    }

    let take = if count <= 0 {
        waiters.len()
    } else {
        waiters.len().min(count as usize)
    };
    for waiter in &waiters[..take] {
        state.end_wait(waiter.thread, ResultCode::SUCCESS, &[]);
    }
    ok()
}
