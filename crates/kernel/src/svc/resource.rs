use types::ResultCode;

use super::{ok, ret, SvcCall, SvcResult};
use crate::object::{KObject, ObjectKind};
use crate::resource_limit::{LimitableResource, ResourceLimit};
use crate::state::KernelState;

fn which(raw: u64) -> Result<LimitableResource, ResultCode> {
    u32::try_from(raw)
        .ok()
        .and_then(|raw| LimitableResource::try_from(raw).ok())
        .ok_or(ResultCode::INVALID_ENUM_VALUE)
}

fn limit_of<'a>(state: &'a KernelState, call: &SvcCall, index: usize) -> Result<&'a ResourceLimit, ResultCode> {
    let id = state.resolve_as(call.thread, call.handle(index), ObjectKind::ResourceLimit)?;
    state.objects.resource_limit(id).ok_or(ResultCode::INVALID_HANDLE)
}

pub(super) fn get_limit_value(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let which = which(call.arg(2))?;
    let value = limit_of(state, call, 1)?.limit_value(which);
    ret(&[value as u64])
}

pub(super) fn get_current_value(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let which = which(call.arg(2))?;
    let value = limit_of(state, call, 1)?.current_value(which);
    ret(&[value as u64])
}

pub(super) fn create_resource_limit(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let id = state.objects.insert(KObject::ResourceLimit(ResourceLimit::default()));
    let handle = state.add_new_handle(call.process, id)?;
    ret(&[handle.raw() as u64])
}

pub(super) fn set_limit_value(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let which = which(call.arg(1))?;
    let value = call.i64(2);
    if value < 0 {
        return Err(ResultCode::OUT_OF_RANGE);
    }
    let id = state.resolve_as(call.thread, call.handle(0), ObjectKind::ResourceLimit)?;
    let limit = state
        .objects
        .resource_limit_mut(id)
        .ok_or(ResultCode::INVALID_HANDLE)?;
    if !limit.set_limit_value(which, value) {
        return Err(ResultCode::INVALID_STATE);
    }
    ok()
}
