//! Host-facing handle to a running kernel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpu::{ExecutorFactory, HaltSignal, ThreadContext};
use log::{info, warn};
use memory::{AddressSpace, DeviceMemory, Direction, MappingObserver, MemoryManager, Pool};
use types::{align_up, Handle, MemoryPermission, MemoryState, ResultCode, VAddr, PAGE_SIZE};

use crate::config::KernelConfig;
use crate::core_worker::{run_ticker, CoreWorker, IcacheObserver};
use crate::hle::{HleEvent, HleItem, HleReply, HleRequest, ObjectRef, SessionKey};
use crate::ipc::OutgoingMessage;
use crate::object::KObject;
use crate::report::{FatalKind, KernelEvent};
use crate::shared_memory::SharedMemory;
use crate::state::{write_space, KernelState, ProcessParams};

pub struct KernelInner {
    state: Mutex<KernelState>,
    pub(crate) work: Condvar,
    hle: Condvar,
    events: Condvar,
    pub(crate) shutdown: AtomicBool,
    pub(crate) icache: Arc<IcacheObserver>,
}

impl KernelInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wakes idle cores and anyone waiting for HLE traffic or events.
    pub(crate) fn notify(&self) {
        self.work.notify_all();
        self.hle.notify_all();
        self.events.notify_all();
    }

    /// Waits on `condvar` until `ready` yields a value or `timeout` passes.
    fn wait_for<T>(
        &self,
        condvar: &Condvar,
        timeout: Duration,
        mut ready: impl FnMut(&mut KernelState) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(value) = ready(&mut state) {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline || self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            state = condvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

/// The emulated kernel: objects, scheduler and the core workers.
///
/// Cheap to clone; every clone drives the same kernel.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        Self::with_observers(config, Vec::new())
    }

    /// Creates a kernel whose address spaces also report to `observers`,
    /// e.g. a video memory manager mirroring guest mappings.
    pub fn with_observers(config: KernelConfig, mut observers: Vec<Arc<dyn MappingObserver>>) -> Self {
        let device = Arc::new(DeviceMemory::new(config.pool_sizes.total()));
        let memory = Arc::new(MemoryManager::new(device, config.pool_sizes));
        let halts = (0..config.num_cores).map(|_| HaltSignal::new()).collect();
        let icache = Arc::new(IcacheObserver::new(config.num_cores));
        observers.push(icache.clone());
        let state = KernelState::new(config, memory, halts, observers);
        Self {
            inner: Arc::new(KernelInner {
                state: Mutex::new(state),
                work: Condvar::new(),
                hle: Condvar::new(),
                events: Condvar::new(),
                shutdown: AtomicBool::new(false),
                icache,
            }),
        }
    }

    /// Runs `f` with the kernel state locked. Meant for inspection in tests
    /// and tools; do not drop an [`ObjectRef`] inside `f`.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut state = self.inner.lock();
        let result = f(&mut state);
        drop(state);
        self.inner.notify();
        result
    }

    pub fn config(&self) -> KernelConfig {
        self.inner.lock().config.clone()
    }

    pub fn memory_manager(&self) -> Arc<MemoryManager> {
        self.inner.lock().memory().clone()
    }

    /// Spawns one worker thread per core plus the ticker.
    pub fn start(&self, factory: Arc<dyn ExecutorFactory>) -> io::Result<Vec<JoinHandle<()>>> {
        let halts: Vec<HaltSignal> = {
            let state = self.inner.lock();
            (0..state.scheduler.num_cores())
                .filter_map(|core| state.scheduler.halt_signal(core).cloned())
                .collect()
        };
        info!("starting {} cores", halts.len());
        let mut workers = Vec::with_capacity(halts.len());
        for (core, halt) in halts.into_iter().enumerate() {
            let executor = factory.create(core, halt);
            let worker = CoreWorker::new(core, self.inner.clone(), executor);
            workers.push(
                thread::Builder::new()
                    .name(format!("core{}", core))
                    .spawn(move || worker.run())?,
            );
        }
        let inner = self.inner.clone();
        workers.push(
            thread::Builder::new()
                .name("ticker".into())
                .spawn(move || run_ticker(inner))?,
        );
        Ok(workers)
    }

    /// Asks every worker to stop after its current slice.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let state = self.inner.lock();
            for core in 0..state.scheduler.num_cores() {
                if let Some(halt) = state.scheduler.halt_signal(core) {
                    halt.raise();
                }
            }
        }
        self.inner.notify();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    // ---- processes -----------------------------------------------------

    pub fn create_process(&self, params: &ProcessParams) -> Result<u64, ResultCode> {
        let mut state = self.inner.lock();
        let process = state.create_process(params)?;
        state
            .objects
            .process(process)
            .map(|p| p.pid)
            .ok_or(ResultCode::INVALID_HANDLE)
    }

    /// Maps fresh pages with `perm` at `addr` covering `size` bytes and
    /// copies `data` to the start.
    pub fn map_segment(
        &self,
        pid: u64,
        addr: VAddr,
        data: &[u8],
        size: u64,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        let size = align_up(size.max(data.len() as u64), PAGE_SIZE);
        if size == 0 {
            return Err(ResultCode::INVALID_SIZE);
        }
        self.with_address_space(pid, |space| {
            space.allocate_and_map(addr, (size / PAGE_SIZE) as usize, state, perm)?;
            let result = space.write(addr, data);
            if result.is_err() {
                let _ = space.unmap_pages(addr, (size / PAGE_SIZE) as usize, state);
            }
            result
        })?
    }

    /// Maps the main stack, creates the main thread and starts it.
    pub fn start_process(&self, pid: u64, entry: VAddr, priority: u32, stack_size: u64) -> Result<u64, ResultCode> {
        let mut state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        let thread = state.start_process(process, entry, priority, stack_size)?;
        let tid = state.objects.thread(thread).map_or(0, |t| t.tid);
        drop(state);
        self.inner.notify();
        Ok(tid)
    }

    pub fn terminate_process(&self, pid: u64) -> Result<(), ResultCode> {
        let mut state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        state.terminate_process(process, None);
        drop(state);
        self.inner.notify();
        Ok(())
    }

    pub fn process_ids(&self) -> Vec<u64> {
        self.inner.lock().processes.keys().copied().collect()
    }

    pub fn read_memory(&self, pid: u64, addr: VAddr, len: usize) -> Result<Vec<u8>, ResultCode> {
        let state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        state.read_guest(process, addr, len)
    }

    pub fn write_memory(&self, pid: u64, addr: VAddr, data: &[u8]) -> Result<(), ResultCode> {
        let state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        state.write_guest(process, addr, data)
    }

    pub fn duplicate_handle(&self, pid: u64, handle: Handle) -> Result<Handle, ResultCode> {
        let mut state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        state.duplicate_handle(process, handle)
    }

    pub fn close_handle(&self, pid: u64, handle: Handle) -> Result<(), ResultCode> {
        let mut state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        state.close_handle(process, handle)
    }

    pub fn with_address_space<R>(&self, pid: u64, f: impl FnOnce(&mut AddressSpace) -> R) -> Result<R, ResultCode> {
        let state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        let space = state.address_space(process)?;
        let mut space = write_space(&space);
        Ok(f(&mut space))
    }

    // ---- events --------------------------------------------------------

    pub fn next_event(&self, timeout: Duration) -> Option<KernelEvent> {
        self.inner
            .wait_for(&self.inner.events, timeout, |state| state.events.pop_front())
    }

    /// Waits until process `pid` is gone. Returns false on timeout.
    pub fn wait_for_exit(&self, pid: u64, timeout: Duration) -> bool {
        self.inner
            .wait_for(&self.inner.events, timeout, |state| {
                (!state.processes.contains_key(&pid)).then_some(())
            })
            .is_some()
    }

    // ---- HLE services --------------------------------------------------

    /// Creates a port whose sessions are served by the host.
    pub fn create_hle_port(&self, name: &str, max_sessions: u32) -> ObjectRef {
        let id = self
            .inner
            .lock()
            .create_hle_port(Some(name.to_string()), max_sessions);
        ObjectRef::adopt(self.inner.clone(), id)
    }

    /// Makes `port` reachable through ConnectToNamedPort.
    pub fn register_named_port(&self, name: &str, port: &ObjectRef) -> Result<(), ResultCode> {
        self.inner.lock().register_named_port(name, port.id())
    }

    pub fn unregister_named_port(&self, name: &str) -> Result<(), ResultCode> {
        let result = self.inner.lock().unregister_named_port(name);
        self.inner.notify();
        result
    }

    /// Creates a guest-served port: (server port, client port).
    pub fn create_port(&self, name: &str, max_sessions: u32) -> (ObjectRef, ObjectRef) {
        let (server, client) = self
            .inner
            .lock()
            .create_guest_port(Some(name.to_string()), max_sessions);
        (
            ObjectRef::adopt(self.inner.clone(), server),
            ObjectRef::adopt(self.inner.clone(), client),
        )
    }

    /// Opens a session through `port` on behalf of process `pid`, charging
    /// that process's session limit.
    pub fn connect_port(&self, port: &ObjectRef, pid: Option<u64>) -> Result<ObjectRef, ResultCode> {
        let mut state = self.inner.lock();
        let caller = pid.and_then(|pid| state.process_by_pid(pid).ok());
        let session = state.connect(port.id(), caller)?;
        drop(state);
        self.inner.notify();
        Ok(ObjectRef::adopt(self.inner.clone(), session))
    }

    /// Creates a session served by the host that is not bound to a port.
    /// The client end is returned for handing to a guest.
    pub fn create_hle_session(&self) -> (SessionKey, ObjectRef) {
        let (server, client) = self
            .inner
            .lock()
            .create_session_pair(None, true, None, None);
        (SessionKey::from_id(server), ObjectRef::adopt(self.inner.clone(), client))
    }

    /// Next request or session close for the service thread.
    pub fn next_hle_event(&self, timeout: Duration) -> Option<HleEvent> {
        let kernel = self.inner.clone();
        self.inner.wait_for(&self.inner.hle, timeout, |state| {
            let item = state.hle_queue.pop_front()?;
            let adopt = |ids: Vec<_>| -> Vec<ObjectRef> {
                ids.into_iter()
                    .map(|id| ObjectRef::adopt(kernel.clone(), id))
                    .collect()
            };
            Some(match item {
                HleItem::Request {
                    id,
                    session,
                    port,
                    pid,
                    tid,
                    message,
                    copies,
                    moves,
                } => HleEvent::Request(HleRequest {
                    id,
                    session: SessionKey::from_id(session),
                    port,
                    pid,
                    tid,
                    message,
                    copy_objects: adopt(copies),
                    move_objects: adopt(moves),
                }),
                HleItem::SessionClosed(session) => HleEvent::SessionClosed(SessionKey::from_id(session)),
            })
        })
    }

    /// Delivers the answer to request `id` and wakes the client.
    pub fn reply_hle(&self, id: u64, reply: HleReply) -> Result<(), ResultCode> {
        let out = OutgoingMessage {
            buffer: reply.message,
            copies: reply.copy_objects.into_iter().map(ObjectRef::into_id).collect(),
            moves: reply.move_objects.into_iter().map(ObjectRef::into_id).collect(),
        };
        let result = self.inner.lock().reply_hle(id, out, reply.close_session);
        self.inner.notify();
        result
    }

    /// Drops the host's end of an HLE session.
    pub fn close_hle_session(&self, session: SessionKey) {
        self.inner.lock().release_hle_session(session.id());
        self.inner.notify();
    }

    /// Shared memory owned by a service; guests map it with the remote
    /// permission.
    pub fn create_shared_memory(
        &self,
        size: u64,
        owner_permission: MemoryPermission,
        remote_permission: MemoryPermission,
    ) -> Result<ObjectRef, ResultCode> {
        let size = align_up(size, PAGE_SIZE);
        if size == 0 {
            return Err(ResultCode::INVALID_SIZE);
        }
        let mut state = self.inner.lock();
        let group = state.memory().allocate_and_open(
            (size / PAGE_SIZE) as usize,
            Pool::System,
            Direction::FromBack,
        )?;
        let id = state.objects.insert(KObject::SharedMemory(SharedMemory {
            group,
            size,
            owner_pid: None,
            owner_permission,
            remote_permission,
        }));
        drop(state);
        Ok(ObjectRef::adopt(self.inner.clone(), id))
    }

    pub fn read_shared_memory(&self, shm: &ObjectRef, offset: u64, out: &mut [u8]) -> Result<(), ResultCode> {
        let state = self.inner.lock();
        let object = state
            .objects
            .shared_memory(shm.id())
            .ok_or(ResultCode::INVALID_HANDLE)?;
        object.read(state.memory().device_memory(), offset, out)
    }

    pub fn write_shared_memory(&self, shm: &ObjectRef, offset: u64, data: &[u8]) -> Result<(), ResultCode> {
        let state = self.inner.lock();
        let object = state
            .objects
            .shared_memory(shm.id())
            .ok_or(ResultCode::INVALID_HANDLE)?;
        object.write(state.memory().device_memory(), offset, data)
    }

    /// A service reported a fatal error for `pid`: publish it and stop the
    /// process.
    pub fn report_service_fatal(&self, pid: u64, tid: u64, rc: ResultCode) -> Result<(), ResultCode> {
        let mut state = self.inner.lock();
        let process = state.process_by_pid(pid)?;
        let thread = state.objects.process(process).and_then(|p| {
            p.threads
                .iter()
                .copied()
                .find(|&t| state.objects.thread(t).map(|t| t.tid) == Some(tid))
        });
        match thread {
            Some(thread) => state.report_fatal(thread, FatalKind::Service(rc)),
            None => {
                warn!("fatal {} for pid {} from unknown thread {}", rc, pid, tid);
                state.events.push_back(KernelEvent::Fatal {
                    pid,
                    kind: FatalKind::Service(rc),
                    registers: Box::new(ThreadContext::default()),
                });
                state.terminate_process(process, None);
            }
        }
        drop(state);
        self.inner.notify();
        Ok(())
    }
}
