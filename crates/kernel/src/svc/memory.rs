use memory::{Direction, PageGroup};
use types::{is_aligned, MemoryInfo, MemoryPermission, MemoryState, ResultCode, PAGE_SIZE};

use super::{ok, ret, SvcCall, SvcResult};
use crate::object::{KObject, ObjectKind};
use crate::shared_memory::SharedMemory;
use crate::state::{read_space, write_space, KernelState};

fn check_range(addr: u64, size: u64) -> Result<(), ResultCode> {
    if !is_aligned(addr, PAGE_SIZE) {
        return Err(ResultCode::INVALID_ADDRESS);
    }
    if size == 0 || !is_aligned(size, PAGE_SIZE) {
        return Err(ResultCode::INVALID_SIZE);
    }
    if addr.checked_add(size).is_none() {
        return Err(ResultCode::INVALID_MEMORY_REGION);
    }
    Ok(())
}

fn permission(raw: u64) -> Result<MemoryPermission, ResultCode> {
    MemoryPermission::from_bits(raw as u32).ok_or(ResultCode::INVALID_NEW_MEMORY_PERMISSION)
}

pub(super) fn set_heap_size(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let size = call.arg(1);
    let space = state.address_space(call.process)?;
    let current = read_space(&space).heap_size();
    state.charge_heap(call.process, size)?;
    let resized = write_space(&space).set_heap_size(size);
    match resized {
        Ok(addr) => ret(&[addr]),
        Err(rc) => {
            let _ = state.charge_heap(call.process, current);
            Err(rc)
        }
    }
}

pub(super) fn set_memory_permission(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (addr, size) = (call.arg(0), call.arg(1));
    check_range(addr, size)?;
    let perm = permission(call.arg(2))?;
    let space = state.address_space(call.process)?;
    write_space(&space).set_memory_permission(addr, size, perm)?;
    ok()
}

pub(super) fn map_memory(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (dst, src, size) = (call.arg(0), call.arg(1), call.arg(2));
    check_range(dst, size)?;
    check_range(src, size)?;
    let space = state.address_space(call.process)?;
    write_space(&space).map_memory(dst, src, size)?;
    ok()
}

pub(super) fn unmap_memory(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (dst, src, size) = (call.arg(0), call.arg(1), call.arg(2));
    check_range(dst, size)?;
    check_range(src, size)?;
    let space = state.address_space(call.process)?;
    write_space(&space).unmap_memory(dst, src, size)?;
    ok()
}

pub(super) fn query_memory(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (info_ptr, addr) = (call.arg(0), call.arg(2));
    let space = state.address_space(call.process)?;
    let info: MemoryInfo = read_space(&space).query_memory(addr);
    state.write_guest(call.process, info_ptr, &info.to_guest_bytes())?;
    ret(&[0])
}

pub(super) fn create_shared_memory(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let size = call.arg(1);
    if size == 0 || !is_aligned(size, PAGE_SIZE) {
        return Err(ResultCode::INVALID_SIZE);
    }
    let owner_permission = permission(call.arg(2))?;
    let remote_permission = permission(call.arg(3))?;
    if owner_permission != MemoryPermission::READ && owner_permission != MemoryPermission::READ_WRITE {
        return Err(ResultCode::INVALID_NEW_MEMORY_PERMISSION);
    }
    if remote_permission != MemoryPermission::DONT_CARE && !remote_permission.is_user_settable() {
        return Err(ResultCode::INVALID_NEW_MEMORY_PERMISSION);
    }
    let space = state.address_space(call.process)?;
    let pool = read_space(&space).pool();
    let group = state.memory().allocate_and_open(
        (size / PAGE_SIZE) as usize,
        pool,
        Direction::FromBack,
    )?;
    let pid = state.objects.process(call.process).map(|p| p.pid);
    let id = state.objects.insert(KObject::SharedMemory(SharedMemory {
        group,
        size,
        owner_pid: pid,
        owner_permission,
        remote_permission,
    }));
    let handle = state.add_new_handle(call.process, id)?;
    ret(&[handle.raw() as u64])
}

fn shared_group(state: &KernelState, call: &SvcCall, pid: u64, size: u64, perm: Option<MemoryPermission>) -> Result<PageGroup, ResultCode> {
    let id = state.resolve_as(call.thread, call.handle(0), ObjectKind::SharedMemory)?;
    let shm = state
        .objects
        .shared_memory(id)
        .ok_or(ResultCode::INVALID_HANDLE)?;
    if shm.size != size {
        return Err(ResultCode::INVALID_SIZE);
    }
    if let Some(perm) = perm {
        shm.check_permission(pid, perm)?;
    }
    Ok(shm.group.clone())
}

pub(super) fn map_shared_memory(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (addr, size) = (call.arg(1), call.arg(2));
    check_range(addr, size)?;
    let perm = permission(call.arg(3))?;
    let pid = state.objects.process(call.process).map_or(0, |p| p.pid);
    let group = shared_group(state, call, pid, size, Some(perm))?;
    let space = state.address_space(call.process)?;
    write_space(&space).map_page_group(addr, &group, MemoryState::Shared, perm)?;
    ok()
}

pub(super) fn unmap_shared_memory(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (addr, size) = (call.arg(1), call.arg(2));
    check_range(addr, size)?;
    let group = shared_group(state, call, 0, size, None)?;
    let space = state.address_space(call.process)?;
    let mut space = write_space(&space);
    let mapped = space.page_group_of(addr, group.num_pages())?;
    if !mapped.is_equivalent_to(&group) {
        return Err(ResultCode::INVALID_MEMORY_REGION);
    }
    space.unmap_pages(addr, group.num_pages(), MemoryState::Shared)?;
    ok()
}
