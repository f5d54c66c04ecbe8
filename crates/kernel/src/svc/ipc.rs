use types::{Handle, ResultCode, VAddr};

use super::{ok, ret, SvcCall, SvcOutcome, SvcResult};
use crate::arena::ObjectId;
use crate::object::ObjectKind;
use crate::state::{read_space, KernelState};
use crate::thread::WaitKind;

/// Longest port name, not counting the terminator.
const MAX_PORT_NAME: usize = 11;
const MAX_RECEIVE_OBJECTS: u64 = 64;

fn read_port_name(state: &KernelState, call: &SvcCall, addr: VAddr) -> Result<String, ResultCode> {
    let space = state.address_space(call.process)?;
    let name = read_space(&space)
        .read_cstring(addr, MAX_PORT_NAME + 1)
        .map_err(|_| ResultCode::INVALID_POINTER)?;
    if name.len() > MAX_PORT_NAME {
        return Err(ResultCode::OUT_OF_RANGE);
    }
    Ok(name)
}

pub(super) fn connect_to_named_port(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let name = read_port_name(state, call, call.arg(1))?;
    let port = *state.named_ports.get(&name).ok_or(ResultCode::NOT_FOUND)?;
    let session = state.connect(port, Some(call.process))?;
    let handle = state.add_new_handle(call.process, session)?;
    ret(&[handle.raw() as u64])
}

pub(super) fn send_sync_request(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let session = state.resolve_as(call.thread, call.handle(0), ObjectKind::ClientSession)?;
    state.send_request(call.thread, session)?;
    Ok(SvcOutcome::Blocked)
}

pub(super) fn create_session(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let limit = state.reserve_session(Some(call.process))?;
    let (server, client) = state.create_session_pair(None, false, None, limit);
    let server_handle = match state.add_new_handle(call.process, server) {
        Ok(handle) => handle,
        Err(rc) => {
            state.close_object(client);
            return Err(rc);
        }
    };
    match state.add_new_handle(call.process, client) {
        Ok(client_handle) => ret(&[server_handle.raw() as u64, client_handle.raw() as u64]),
        Err(rc) => {
            let _ = state.close_handle(call.process, server_handle);
            Err(rc)
        }
    }
}

pub(super) fn accept_session(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let port = state.resolve_as(call.thread, call.handle(1), ObjectKind::ServerPort)?;
    let session = state
        .objects
        .server_port_mut(port)
        .and_then(|p| p.pending.pop_front())
        .ok_or(ResultCode::NOT_FOUND)?;
    let handle = state.add_new_handle(call.process, session)?;
    ret(&[handle.raw() as u64])
}

/// Answers the request on `target` (if any), then waits for the next
/// signal on the given handles. A signaled server session has its request
/// copied into the caller's message buffer.
pub(super) fn reply_and_receive(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (ptr, count, target, timeout) = (call.arg(1), call.arg(2), call.handle(3), call.i64(4));
    if count > MAX_RECEIVE_OBJECTS {
        return Err(ResultCode::OUT_OF_RANGE);
    }
    let raw = state
        .read_guest(call.process, ptr, count as usize * 4)
        .map_err(|_| ResultCode::INVALID_POINTER)?;
    let mut objects: Vec<ObjectId> = Vec::with_capacity(count as usize);
    for chunk in raw.chunks_exact(4) {
        let handle = Handle(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        let id = state.resolve(call.thread, handle)?;
        if state.is_signaled(id).is_none() {
            return Err(ResultCode::INVALID_HANDLE);
        }
        objects.push(id);
    }

    if target != Handle::INVALID {
        let session = state.resolve_as(call.thread, target, ObjectKind::ServerSession)?;
        if let Err(rc) = state.reply_from_guest(call.thread, session) {
            let index = objects.iter().position(|&o| o == session).map_or(u64::MAX, |i| i as u64);
            return Ok(SvcOutcome::ReturnWith(rc, vec![index]));
        }
    }

    if let Some(t) = state.objects.thread_mut(call.thread) {
        if std::mem::take(&mut t.cancel_pending) {
            return Err(ResultCode::CANCELLED);
        }
    }
    if let Some(index) = objects.iter().position(|&o| state.is_signaled(o) == Some(true)) {
        let object = objects[index];
        if state.objects.kind(object) == Some(ObjectKind::ServerSession) {
            if let Err(rc) = state.receive_request(call.thread, object) {
                return Ok(SvcOutcome::ReturnWith(rc, vec![index as u64]));
            }
        }
        return ret(&[index as u64]);
    }
    if timeout == 0 {
        return Err(ResultCode::TIMED_OUT);
    }
    state.wait_on_objects(call.thread, WaitKind::Receive { objects }, timeout);
    Ok(SvcOutcome::Blocked)
}

pub(super) fn manage_named_port(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let name = read_port_name(state, call, call.arg(1))?;
    let max_sessions = call.arg(2) as i64;
    if max_sessions < 0 || max_sessions > i32::MAX as i64 {
        return Err(ResultCode::OUT_OF_RANGE);
    }
    if max_sessions == 0 {
        state.unregister_named_port(&name)?;
        return ok();
    }

    let (server, client) = state.create_guest_port(Some(name.clone()), max_sessions as u32);
    let registered = state.register_named_port(&name, client);
    state.close_object(client);
    if let Err(rc) = registered {
        state.close_object(server);
        return Err(rc);
    }
    match state.add_new_handle(call.process, server) {
        Ok(handle) => ret(&[handle.raw() as u64]),
        Err(rc) => {
            let _ = state.unregister_named_port(&name);
            Err(rc)
        }
    }
}
