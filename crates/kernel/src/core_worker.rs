//! One host thread per emulated core.
//!
//! A worker picks the most urgent ready thread for its core, runs it on its
//! executor with the kernel lock released, then handles whatever made the
//! executor stop. All kernel bookkeeping happens under the lock between
//! slices.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use cpu::{Executor, GuestMemory, HaltReason, ThreadContext};
use log::{debug, trace};
use memory::{AddressSpace, MappingObserver};
use types::{MemoryPermission, MemoryState, ResultCode, VAddr};

use crate::arena::ObjectId;
use crate::kernel::KernelInner;
use crate::report::FatalKind;
use crate::state::{read_space, KernelState};
use crate::svc::{self, SvcOutcome};
use crate::thread::ThreadState;

/// Longest an idle core sleeps before re-checking timers.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// A process address space seen through the executor's memory interface.
pub(crate) struct ProcessMemory(pub Arc<RwLock<AddressSpace>>);

impl GuestMemory for ProcessMemory {
    fn read(&self, addr: VAddr, out: &mut [u8]) -> Result<(), ResultCode> {
        read_space(&self.0).read(addr, out)
    }

    fn write(&self, addr: VAddr, data: &[u8]) -> Result<(), ResultCode> {
        read_space(&self.0).write(addr, data)
    }
}

/// Collects unmapped ranges so every core drops translated code for them
/// before its next slice.
#[derive(Debug)]
pub(crate) struct IcacheObserver {
    pending: Mutex<Vec<Vec<(VAddr, u64)>>>,
}

impl IcacheObserver {
    pub fn new(num_cores: usize) -> Self {
        Self {
            pending: Mutex::new(vec![Vec::new(); num_cores]),
        }
    }

    pub fn take(&self, core: usize) -> Vec<(VAddr, u64)> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.get_mut(core).map(std::mem::take).unwrap_or_default()
    }

    fn push(&self, addr: VAddr, size: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for ranges in pending.iter_mut() {
            ranges.push((addr, size));
        }
    }
}

impl MappingObserver for IcacheObserver {
    fn on_unmap(&self, _asid: u64, addr: VAddr, size: u64) {
        self.push(addr, size);
    }

    fn on_protect(&self, _asid: u64, addr: VAddr, size: u64, perm: MemoryPermission) {
        if !perm.contains(MemoryPermission::EXECUTE) {
            self.push(addr, size);
        }
    }

    fn on_map(
        &self,
        _asid: u64,
        _addr: VAddr,
        _size: u64,
        _state: MemoryState,
        _perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        Ok(())
    }
}

/// What the worker took out of the kernel to run one slice.
struct Slice {
    thread: ObjectId,
    pid: u64,
    context: ThreadContext,
    space: Arc<RwLock<AddressSpace>>,
}

pub(crate) struct CoreWorker {
    core: usize,
    kernel: Arc<KernelInner>,
    executor: Box<dyn Executor>,
    loaded_pid: Option<u64>,
}

impl CoreWorker {
    pub fn new(core: usize, kernel: Arc<KernelInner>, executor: Box<dyn Executor>) -> Self {
        Self {
            core,
            kernel,
            executor,
            loaded_pid: None,
        }
    }

    pub fn run(mut self) {
        debug!("core {} started", self.core);
        while !self.kernel.shutdown.load(Ordering::Acquire) {
            let Some(slice) = self.next_slice() else {
                continue;
            };
            self.run_slice(slice);
        }
        let mut state = self.kernel.lock();
        state.scheduler.clear_running(self.core);
        debug!("core {} stopped", self.core);
    }

    /// Picks a thread, or sleeps until there may be one.
    fn next_slice(&mut self) -> Option<Slice> {
        let mut state = self.kernel.lock();
        let now = Instant::now();
        state.fire_timers(now);

        let Some(thread) = state.scheduler.pick(self.core) else {
            state.scheduler.clear_running(self.core);
            let wait = state.timers.time_to_next(now, IDLE_POLL);
            let _ = self.kernel.work.wait_timeout(state, wait);
            return None;
        };
        let prepared = prepare(&mut state, self.core, thread);
        if prepared.is_none() {
            state.scheduler.clear_running(self.core);
        }
        prepared
    }

    fn run_slice(&mut self, slice: Slice) {
        if self.loaded_pid != Some(slice.pid) {
            self.executor
                .set_memory(Arc::new(ProcessMemory(slice.space.clone())));
            self.loaded_pid = Some(slice.pid);
        }
        for (addr, size) in self.kernel.icache.take(self.core) {
            self.executor.invalidate_cache_range(addr, size);
        }
        self.executor.load_context(&slice.context);
        let reason = self.executor.execute();

        let mut state = self.kernel.lock();
        let thread = slice.thread;
        let Some(t) = state.objects.thread_mut(thread) else {
            state.scheduler.clear_running(self.core);
            return;
        };
        self.executor.save_context(&mut t.context);
        t.ticks += 1;

        let outcome = match reason {
            HaltReason::SupervisorCall => {
                svc::dispatch(&mut state, thread, self.core, self.executor.svc_number())
            }
            HaltReason::BreakLoop => SvcOutcome::Yield,
            fault => {
                state.report_fatal(thread, FatalKind::Fault(fault));
                SvcOutcome::Exited
            }
        };
        self.finish_slice(&mut state, thread, reason, &outcome);
        drop(state);
        self.kernel.notify();
    }

    /// Puts the thread back in the ready queue if it is still running.
    fn finish_slice(
        &self,
        state: &mut KernelState,
        thread: ObjectId,
        reason: HaltReason,
        outcome: &SvcOutcome,
    ) {
        let core = self.core;
        let expired = state.scheduler.quantum_expired(core);
        let Some(t) = state.objects.thread_mut(thread) else {
            state.scheduler.clear_running(core);
            return;
        };
        if t.terminate_requested && t.is_alive() {
            state.exit_thread(thread);
            state.scheduler.clear_running(core);
            return;
        }
        if t.state != ThreadState::Running {
            state.scheduler.clear_running(core);
            return;
        }
        t.state = ThreadState::Ready;
        let (priority, affinity) = (t.priority, t.affinity);
        let yielded = matches!(outcome, SvcOutcome::Yield) && reason == HaltReason::SupervisorCall;
        let front = !expired && !yielded && affinity & (1 << core) != 0;
        if expired || yielded {
            state.scheduler.clear_running(core);
        }
        trace!("core {}: requeue {:?} (front: {})", core, thread, front);
        state.scheduler.enqueue(thread, priority, affinity, front);
    }
}

/// Keeps time while every core may be busy in guest code: fires wait
/// deadlines and interrupts cores whose quantum ran out under contention.
pub(crate) fn run_ticker(kernel: Arc<KernelInner>) {
    let mut state = kernel.lock();
    while !kernel.shutdown.load(Ordering::Acquire) {
        let now = Instant::now();
        let ready = state.scheduler.ready_count();
        state.fire_timers(now);
        if state.scheduler.ready_count() > ready {
            kernel.work.notify_all();
        }
        let mut wait = state.timers.time_to_next(now, IDLE_POLL);
        if let Some(end) = state.scheduler.expire_quanta(now) {
            wait = wait.min(end.saturating_duration_since(now));
        }
        state = kernel
            .work
            .wait_timeout(state, wait)
            .unwrap_or_else(|e| e.into_inner())
            .0;
    }
    trace!("ticker stopped");
}

/// Marks `thread` running on `core` and snapshots what the executor needs.
fn prepare(state: &mut KernelState, core: usize, thread: ObjectId) -> Option<Slice> {
    let process = match state.process_of(thread) {
        Ok(process) => process,
        Err(_) => {
            state.exit_thread(thread);
            return None;
        }
    };
    let t = state.objects.thread_mut(thread)?;
    if t.state != ThreadState::Ready {
        return None;
    }
    if t.terminate_requested {
        state.exit_thread(thread);
        return None;
    }
    t.state = ThreadState::Running;
    let (pid, priority, context) = (t.pid, t.priority, t.context.clone());
    state.scheduler.set_running(core, thread, priority);
    let space = state.address_space(process).ok()?;
    Some(Slice {
        thread,
        pid,
        context,
        space,
    })
}
