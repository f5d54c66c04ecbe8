use log::{info, warn};

use super::{ok, SvcCall, SvcOutcome, SvcResult};
use crate::report::{FatalKind, KernelEvent};
use crate::state::{read_space, KernelState};

/// Break reasons with this bit only notify a debugger; execution goes on.
const BREAK_NOTIFICATION_ONLY: u64 = 0x8000_0000;
const MAX_DEBUG_STRING: u64 = 0x1000;

pub(super) fn break_(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let reason = call.arg(0);
    let pid = state.objects.process(call.process).map_or(0, |p| p.pid);
    if reason & BREAK_NOTIFICATION_ONLY != 0 {
        warn!("process {}: break notification 0x{:x} (info 0x{:x}, size 0x{:x})", pid, reason, call.arg(1), call.arg(2));
        return ok();
    }
    state.report_fatal(call.thread, FatalKind::Break { reason });
    Ok(SvcOutcome::Exited)
}

pub(super) fn output_debug_string(state: &mut KernelState, call: &SvcCall) -> SvcResult {
    let (addr, len) = (call.arg(0), call.arg(1).min(MAX_DEBUG_STRING));
    if len == 0 {
        return ok();
    }
    let bytes = {
        let space = state.address_space(call.process)?;
        let bytes = read_space(&space).read_bytes(addr, len as usize);
        bytes?
    };
    let text = String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string();
    let pid = state.objects.process(call.process).map_or(0, |p| p.pid);
    info!("[pid {}] {}", pid, text.trim_end());
    state.events.push_back(KernelEvent::DebugOutput { pid, text });
    ok()
}
