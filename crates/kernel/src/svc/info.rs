use memory::RegionKind;
use types::{Handle, ResultCode, PAGE_SIZE};

use super::{ret, SvcCall, SvcResult};
use crate::object::{KObject, ObjectKind};
use crate::resource_limit::LimitableResource;
use crate::state::{read_space, KernelState};

/// Counter frequency of the emulated system tick.
const TICKS_PER_SECOND: u128 = 19_200_000;

pub(super) fn system_tick(state: &KernelState) -> u64 {
    (state.elapsed().as_nanos() * TICKS_PER_SECOND / 1_000_000_000) as u64
}

mod info_type {
    pub const CORE_MASK: u64 = 0;
    pub const PRIORITY_MASK: u64 = 1;
    pub const ALIAS_REGION_ADDRESS: u64 = 2;
    pub const ALIAS_REGION_SIZE: u64 = 3;
    pub const HEAP_REGION_ADDRESS: u64 = 4;
    pub const HEAP_REGION_SIZE: u64 = 5;
    pub const TOTAL_MEMORY_SIZE: u64 = 6;
    pub const USED_MEMORY_SIZE: u64 = 7;
    pub const DEBUGGER_ATTACHED: u64 = 8;
    pub const RESOURCE_LIMIT: u64 = 9;
    pub const IDLE_TICK_COUNT: u64 = 10;
    pub const RANDOM_ENTROPY: u64 = 11;
    pub const ASLR_REGION_ADDRESS: u64 = 12;
    pub const ASLR_REGION_SIZE: u64 = 13;
    pub const STACK_REGION_ADDRESS: u64 = 14;
    pub const STACK_REGION_SIZE: u64 = 15;
    pub const PROGRAM_ID: u64 = 18;
    pub const USER_EXCEPTION_CONTEXT_ADDRESS: u64 = 20;
    pub const THREAD_TICK_COUNT: u64 = 0xF000_0002;
}

pub(super) fn get_info(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (kind, handle, sub) = (call.arg(1), call.handle(2), call.arg(3));
    use info_type::*;

    match kind {
        CORE_MASK | PRIORITY_MASK | ALIAS_REGION_ADDRESS | ALIAS_REGION_SIZE | HEAP_REGION_ADDRESS
        | HEAP_REGION_SIZE | TOTAL_MEMORY_SIZE | USED_MEMORY_SIZE | ASLR_REGION_ADDRESS
        | ASLR_REGION_SIZE | STACK_REGION_ADDRESS | STACK_REGION_SIZE | PROGRAM_ID
        | USER_EXCEPTION_CONTEXT_ADDRESS => {
            if sub != 0 {
                return Err(ResultCode::INVALID_COMBINATION);
            }
            let process = state.resolve_as(call.thread, handle, ObjectKind::Process)?;
            let p = state.objects.process(process).ok_or(ResultCode::INVALID_HANDLE)?;
            let space = read_space(&p.address_space);
            let region = |k| space.region(k);
            let value = match kind {
                CORE_MASK => p.core_mask,
                PRIORITY_MASK => priority_mask(p.highest_priority),
                ALIAS_REGION_ADDRESS => region(RegionKind::Alias).start,
                ALIAS_REGION_SIZE => region(RegionKind::Alias).size,
                HEAP_REGION_ADDRESS => region(RegionKind::Heap).start,
                HEAP_REGION_SIZE => region(RegionKind::Heap).size,
                ASLR_REGION_ADDRESS => region(RegionKind::Code).start,
                ASLR_REGION_SIZE => space.layout().address_space_end() - region(RegionKind::Code).start,
                STACK_REGION_ADDRESS => region(RegionKind::Stack).start,
                STACK_REGION_SIZE => region(RegionKind::Stack).size,
                TOTAL_MEMORY_SIZE | USED_MEMORY_SIZE => {
                    let pool = space.pool();
                    let limit = state
                        .objects
                        .resource_limit(p.resource_limit)
                        .map_or(0, |l| l.limit_value(LimitableResource::PhysicalMemory));
                    let manager = state.memory();
                    let total = (manager.total_pages(pool) as u64 * PAGE_SIZE).min(limit.max(0) as u64);
                    if kind == TOTAL_MEMORY_SIZE {
                        total
                    } else {
                        (manager.used_pages(pool) as u64 * PAGE_SIZE).min(total)
                    }
                }
                PROGRAM_ID => p.program_id,
                _ => 0,
            };
            ret(&[value])
        }
        DEBUGGER_ATTACHED => {
            if handle != Handle::INVALID || sub != 0 {
                return Err(ResultCode::INVALID_HANDLE);
            }
            ret(&[0])
        }
        RESOURCE_LIMIT => {
            if handle != Handle::INVALID || sub != 0 {
                return Err(ResultCode::INVALID_HANDLE);
            }
            let limit = state
                .objects
                .process(call.process)
                .map(|p| p.resource_limit)
                .ok_or(ResultCode::INVALID_HANDLE)?;
            let handle = state.add_handle(call.process, limit)?;
            ret(&[handle.raw() as u64])
        }
        IDLE_TICK_COUNT => {
            if handle != Handle::INVALID {
                return Err(ResultCode::INVALID_HANDLE);
            }
            if sub != u64::MAX && sub != call.core as u64 {
                return Err(ResultCode::INVALID_COMBINATION);
            }
            ret(&[0])
        }
        RANDOM_ENTROPY => {
            if handle != Handle::INVALID {
                return Err(ResultCode::INVALID_HANDLE);
            }
            let entropy = state
                .objects
                .process(call.process)
                .map(|p| p.entropy)
                .ok_or(ResultCode::INVALID_HANDLE)?;
            let value = entropy
                .get(sub as usize)
                .copied()
                .ok_or(ResultCode::INVALID_COMBINATION)?;
            ret(&[value])
        }
        THREAD_TICK_COUNT => {
            if sub != u64::MAX && sub >= state.scheduler.num_cores() as u64 {
                return Err(ResultCode::INVALID_COMBINATION);
            }
            let thread = state.resolve(call.thread, handle)?;
            match state.objects.get(thread) {
                Some(KObject::Thread(t)) => ret(&[t.ticks]),
                _ => Err(ResultCode::INVALID_HANDLE),
            }
        }
        _ => Err(ResultCode::INVALID_ENUM_VALUE),
    }
}

/// Bit n set for every priority n the process may use.
fn priority_mask(highest: u8) -> u64 {
    u64::MAX << highest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mask_covers_usable_levels() {
        assert_eq!(priority_mask(0), u64::MAX);
        assert_eq!(priority_mask(28).trailing_zeros(), 28);
    }
}
