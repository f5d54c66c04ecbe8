use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use cpu::{HaltSignal, ThreadContext};
use log::{debug, error, info, trace};
use memory::{AddressSpace, MappingObserver, MemoryManager, Pool, RegionKind};
use types::{Handle, MemoryPermission, MemoryState, ResultCode, VAddr, PAGE_SIZE};

use crate::arena::ObjectId;
use crate::config::KernelConfig;
use crate::handle_table::HandleTable;
use crate::hle::HleItem;
use crate::object::{KObject, ObjectKind, ObjectTable};
use crate::process::{Process, ProcessState, TlsPage, TLS_SLOT_SIZE};
use crate::report::{FatalKind, KernelEvent};
use crate::resource_limit::{LimitableResource, ResourceLimit, ResourceLimitValues};
use crate::scheduler::{Scheduler, LOWEST_PRIORITY};
use crate::sync::WaitQueue;
use crate::thread::{Thread, ThreadState, WaitKind};
use crate::timer::TimerQueue;

/// First process id handed out; lower ids belong to the boot processes of
/// a real system.
pub const FIRST_PROCESS_ID: u64 = 0x51;
pub const FIRST_THREAD_ID: u64 = 0x100;

/// What the host needs to create a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessParams {
    pub name: String,
    pub program_id: u64,
    pub pool: Pool,
    pub ideal_core: usize,
    pub core_mask: u64,
    /// Most urgent priority the process may use.
    pub highest_priority: u8,
    pub resource_limits: Option<ResourceLimitValues>,
}

impl Default for ProcessParams {
    fn default() -> Self {
        Self {
            name: "application".to_string(),
            program_id: 0x0100_0000_0000_1000,
            pool: Pool::Application,
            ideal_core: 0,
            core_mask: 0xF,
            highest_priority: 0,
            resource_limits: None,
        }
    }
}

pub(crate) fn read_space(space: &RwLock<AddressSpace>) -> RwLockReadGuard<'_, AddressSpace> {
    space.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_space(space: &RwLock<AddressSpace>) -> RwLockWriteGuard<'_, AddressSpace> {
    space.write().unwrap_or_else(|e| e.into_inner())
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Everything the kernel knows, behind one lock.
///
/// Core workers hold the lock only between guest slices; supervisor calls
/// run entirely under it. Lock order is kernel state, then an address
/// space.
pub struct KernelState {
    pub objects: ObjectTable,
    pub processes: BTreeMap<u64, ObjectId>,
    pub scheduler: Scheduler,
    pub timers: TimerQueue,
    pub named_ports: BTreeMap<String, ObjectId>,
    pub(crate) hle_queue: VecDeque<HleItem>,
    pub(crate) hle_requests: BTreeMap<u64, ObjectId>,
    pub events: VecDeque<KernelEvent>,
    pub config: KernelConfig,
    memory: Arc<MemoryManager>,
    observers: Vec<Arc<dyn MappingObserver>>,
    start: Instant,
    next_pid: u64,
    next_tid: u64,
    next_seq: u64,
    next_request: u64,
}

impl KernelState {
    pub fn new(
        config: KernelConfig,
        memory: Arc<MemoryManager>,
        halts: Vec<HaltSignal>,
        observers: Vec<Arc<dyn MappingObserver>>,
    ) -> Self {
        let quantum = config.quantum();
        Self {
            objects: ObjectTable::new(),
            processes: BTreeMap::new(),
            scheduler: Scheduler::new(halts, quantum),
            timers: TimerQueue::new(),
            named_ports: BTreeMap::new(),
            hle_queue: VecDeque::new(),
            hle_requests: BTreeMap::new(),
            events: VecDeque::new(),
            config,
            memory,
            observers,
            start: Instant::now(),
            next_pid: FIRST_PROCESS_ID,
            next_tid: FIRST_THREAD_ID,
            next_seq: 0,
            next_request: 1,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub(crate) fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn request_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    // ---- lookups -------------------------------------------------------

    pub fn process_by_pid(&self, pid: u64) -> Result<ObjectId, ResultCode> {
        self.processes
            .get(&pid)
            .copied()
            .ok_or(ResultCode::INVALID_PROCESS_ID)
    }

    pub fn process_of(&self, thread: ObjectId) -> Result<ObjectId, ResultCode> {
        let process = self
            .objects
            .thread(thread)
            .ok_or(ResultCode::INVALID_HANDLE)?
            .process;
        if self.objects.process(process).is_none() {
            return Err(ResultCode::PROCESS_TERMINATED);
        }
        Ok(process)
    }

    pub fn address_space(&self, process: ObjectId) -> Result<Arc<RwLock<AddressSpace>>, ResultCode> {
        self.objects
            .process(process)
            .map(|p| p.address_space.clone())
            .ok_or(ResultCode::INVALID_HANDLE)
    }

    pub fn read_guest(&self, process: ObjectId, addr: VAddr, len: usize) -> Result<Vec<u8>, ResultCode> {
        read_space(&*self.address_space(process)?).read_bytes(addr, len)
    }

    pub fn write_guest(&self, process: ObjectId, addr: VAddr, data: &[u8]) -> Result<(), ResultCode> {
        read_space(&*self.address_space(process)?).write(addr, data)
    }

    pub fn read_guest_u32(&self, process: ObjectId, addr: VAddr) -> Result<u32, ResultCode> {
        let bytes = self.read_guest(process, addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_guest_u32(&self, process: ObjectId, addr: VAddr, value: u32) -> Result<(), ResultCode> {
        self.write_guest(process, addr, &value.to_le_bytes())
    }

    /// Resolves a handle of the process running `thread`, including the
    /// pseudo handles.
    pub fn resolve(&self, thread: ObjectId, handle: Handle) -> Result<ObjectId, ResultCode> {
        if handle == Handle::CURRENT_THREAD {
            return Ok(thread);
        }
        let process = self.process_of(thread)?;
        if handle == Handle::CURRENT_PROCESS {
            return Ok(process);
        }
        let id = self
            .objects
            .process(process)
            .and_then(|p| p.handles.get(handle))
            .ok_or(ResultCode::INVALID_HANDLE)?;
        if !self.objects.contains(id) {
            return Err(ResultCode::INVALID_HANDLE);
        }
        Ok(id)
    }

    /// Like [`resolve`](Self::resolve) but also checks the object type.
    pub fn resolve_as(
        &self,
        thread: ObjectId,
        handle: Handle,
        kind: ObjectKind,
    ) -> Result<ObjectId, ResultCode> {
        let id = self.resolve(thread, handle)?;
        if self.objects.kind(id) != Some(kind) {
            return Err(ResultCode::INVALID_HANDLE);
        }
        Ok(id)
    }

    // ---- handles and references ---------------------------------------

    /// Adds a handle holding a new reference to `object`.
    pub fn add_handle(&mut self, process: ObjectId, object: ObjectId) -> Result<Handle, ResultCode> {
        if !self.objects.open(object) {
            return Err(ResultCode::INVALID_HANDLE);
        }
        self.add_new_handle(process, object)
    }

    /// Adds a handle that takes over a reference the caller already owns.
    /// On failure that reference is closed.
    pub fn add_new_handle(&mut self, process: ObjectId, object: ObjectId) -> Result<Handle, ResultCode> {
        let result = match self.objects.process_mut(process) {
            Some(p) => p.handles.add(object),
            None => Err(ResultCode::INVALID_HANDLE),
        };
        if result.is_err() {
            self.close_object(object);
        }
        result
    }

    /// Gives `handle`'s object a second handle in the same process.
    pub fn duplicate_handle(&mut self, process: ObjectId, handle: Handle) -> Result<Handle, ResultCode> {
        let object = self
            .objects
            .process(process)
            .and_then(|p| p.handles.get(handle))
            .filter(|&id| self.objects.contains(id))
            .ok_or(ResultCode::INVALID_HANDLE)?;
        self.add_handle(process, object)
    }

    pub fn close_handle(&mut self, process: ObjectId, handle: Handle) -> Result<(), ResultCode> {
        let object = self
            .objects
            .process_mut(process)
            .ok_or(ResultCode::INVALID_HANDLE)?
            .handles
            .remove(handle)?;
        self.close_object(object);
        Ok(())
    }

    /// Drops one reference and tears down whatever reaches zero.
    pub fn close_object(&mut self, id: ObjectId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            if let Some(object) = self.objects.release(id) {
                trace!("destroying {:?} {}", id, object.kind());
                self.destroy(id, object, &mut pending);
            }
        }
    }

    fn destroy(&mut self, id: ObjectId, object: KObject, pending: &mut Vec<ObjectId>) {
        match object {
            KObject::Process(process) => pending.push(process.resource_limit),
            KObject::Thread(_) | KObject::ReadableEvent(_) | KObject::ResourceLimit(_) => {}
            KObject::WritableEvent(event) => {
                pending.push(event.readable);
                if let Some(limit) = event.limit {
                    if let Some(l) = self.objects.resource_limit_mut(limit) {
                        l.release(LimitableResource::Events, 1);
                    }
                    pending.push(limit);
                }
            }
            KObject::SharedMemory(shm) => self.memory.close(&shm.group),
            KObject::ServerPort(port) => {
                pending.extend(port.pending);
                if let Some(client) = port.client.and_then(|c| self.objects.client_port_mut(c)) {
                    client.closed = true;
                }
            }
            KObject::ClientPort(_) => {}
            KObject::ServerSession(session) => self.server_session_destroyed(id, session),
            KObject::ClientSession(session) => self.client_session_destroyed(session, pending),
        }
    }

    // ---- waiting -------------------------------------------------------

    /// Signal state of a waitable object; `None` for objects that cannot be
    /// waited on.
    pub fn is_signaled(&self, id: ObjectId) -> Option<bool> {
        match self.objects.get(id)? {
            KObject::Process(p) => Some(p.signaled),
            KObject::Thread(t) => Some(t.signaled),
            KObject::ReadableEvent(e) => Some(e.signaled),
            KObject::ServerPort(p) => Some(!p.pending.is_empty()),
            KObject::ServerSession(s) => Some(s.is_signaled()),
            _ => None,
        }
    }

    fn waiters_mut(&mut self, id: ObjectId) -> Option<&mut WaitQueue> {
        match self.objects.get_mut(id)? {
            KObject::Process(p) => Some(&mut p.waiters),
            KObject::Thread(t) => Some(&mut t.waiters),
            KObject::ReadableEvent(e) => Some(&mut e.waiters),
            KObject::ServerPort(p) => Some(&mut p.waiters),
            KObject::ServerSession(s) => Some(&mut s.waiters),
            _ => None,
        }
    }

    /// Blocks `thread` on `objects`, holding a reference on each until the
    /// wait ends.
    pub(crate) fn wait_on_objects(&mut self, thread: ObjectId, kind: WaitKind, timeout_ns: i64) {
        let objects = match &kind {
            WaitKind::Synchronization { objects } | WaitKind::Receive { objects } => objects.clone(),
            _ => Vec::new(),
        };
        let priority = self.objects.thread(thread).map_or(LOWEST_PRIORITY, |t| t.priority);
        for object in objects {
            let seq = self.seq();
            self.objects.open(object);
            if let Some(waiters) = self.waiters_mut(object) {
                waiters.push(thread, priority, seq);
            }
        }
        self.begin_wait(thread, kind, timeout_ns);
    }

    /// Moves `thread` to Waiting. A positive timeout arms the timer; a
    /// negative one waits forever.
    pub(crate) fn begin_wait(&mut self, thread: ObjectId, kind: WaitKind, timeout_ns: i64) {
        let deadline = (timeout_ns > 0)
            .then(|| Instant::now() + Duration::from_nanos(timeout_ns as u64));
        let key = deadline.map(|d| self.timers.schedule(d, thread));
        self.scheduler.remove(thread);
        if let Some(t) = self.objects.thread_mut(thread) {
            trace!("thread {} waits on {:?}", t.tid, kind);
            t.state = ThreadState::Waiting;
            t.wait = Some(kind);
            t.timer = key;
        }
    }

    /// Detaches a wait from whatever it is queued on.
    fn unlink_wait(&mut self, thread: ObjectId, kind: &WaitKind) {
        match kind {
            WaitKind::Sleep => {}
            WaitKind::Synchronization { objects } | WaitKind::Receive { objects } => {
                for &object in objects {
                    if let Some(waiters) = self.waiters_mut(object) {
                        waiters.remove(thread);
                    }
                    self.close_object(object);
                }
            }
            WaitKind::IpcReply { session, request } => {
                if let Some(s) = self.objects.server_session_mut(*session) {
                    s.abandon(*request);
                }
            }
            WaitKind::Address { .. } | WaitKind::ConditionVariable { .. } => {
                if let Some(p) = self
                    .objects
                    .thread(thread)
                    .map(|t| t.process)
                    .and_then(|p| self.objects.process_mut(p))
                {
                    p.address_waiters.retain(|w| w.thread != thread);
                    p.condition_waiters.retain(|w| w.thread != thread);
                }
            }
            WaitKind::Mutex { owner, .. } => {
                if let Some(o) = self.objects.thread_mut(*owner) {
                    o.mutex_waiters.retain(|&w| w != thread);
                }
            }
        }
    }

    /// Completes a wait: the result goes to x0, `outputs` to x1.. and the
    /// thread becomes ready.
    pub(crate) fn end_wait(&mut self, thread: ObjectId, result: ResultCode, outputs: &[u64]) {
        let Some(t) = self.objects.thread_mut(thread) else {
            return;
        };
        if t.state != ThreadState::Waiting {
            return;
        }
        let kind = t.wait.take();
        if let Some(key) = t.timer.take() {
            self.timers.cancel(key);
        }
        if let Some(kind) = &kind {
            self.unlink_wait(thread, kind);
        }
        if let Some(t) = self.objects.thread_mut(thread) {
            t.context.x[0] = result.raw() as u64;
            for (i, value) in outputs.iter().enumerate() {
                t.context.x[1 + i] = *value;
            }
        }
        self.make_ready(thread);
    }

    pub(crate) fn make_ready(&mut self, thread: ObjectId) {
        let Some(t) = self.objects.thread_mut(thread) else {
            return;
        };
        if !t.is_alive() {
            return;
        }
        t.state = ThreadState::Ready;
        let (priority, affinity) = (t.priority, t.affinity);
        self.scheduler.enqueue(thread, priority, affinity, false);
        self.scheduler.request_preemption(priority, affinity);
    }

    /// Wakes waiters of `object` while it stays signaled, most urgent
    /// first. Receiving a request unsignals a session, so only one receiver
    /// takes each request.
    pub(crate) fn signal_object(&mut self, object: ObjectId) {
        loop {
            if self.is_signaled(object) != Some(true) {
                return;
            }
            let Some(thread) = self.waiters_mut(object).and_then(|w| w.front()) else {
                return;
            };
            let wait = self.objects.thread(thread).and_then(|t| t.wait.clone());
            match wait {
                Some(WaitKind::Synchronization { objects }) => {
                    let index = objects.iter().position(|&o| o == object).unwrap_or(0);
                    self.end_wait(thread, ResultCode::SUCCESS, &[index as u64]);
                }
                Some(WaitKind::Receive { objects }) => {
                    let index = objects.iter().position(|&o| o == object).unwrap_or(0);
                    let result = match self.objects.kind(object) {
                        Some(ObjectKind::ServerSession) => self.receive_request(thread, object),
                        _ => Ok(()),
                    };
                    let rc = result.err().unwrap_or(ResultCode::SUCCESS);
                    self.end_wait(thread, rc, &[index as u64]);
                }
                _ => {
                    if let Some(w) = self.waiters_mut(object) {
                        w.remove(thread);
                    }
                }
            }
        }
    }

    /// Ends every wait whose deadline has passed.
    pub fn fire_timers(&mut self, now: Instant) {
        for thread in self.timers.pop_expired(now) {
            let Some(t) = self.objects.thread_mut(thread) else {
                continue;
            };
            if t.state != ThreadState::Waiting {
                continue;
            }
            t.timer = None;
            let result = match t.wait {
                Some(WaitKind::Sleep) => ResultCode::SUCCESS,
                _ => ResultCode::TIMED_OUT,
            };
            self.end_wait(thread, result, &[]);
        }
    }

    // ---- processes and threads ----------------------------------------

    pub fn create_process(&mut self, params: &ProcessParams) -> Result<ObjectId, ResultCode> {
        if params.ideal_core >= self.scheduler.num_cores()
            || params.core_mask & (1 << params.ideal_core) == 0
        {
            return Err(ResultCode::INVALID_CORE_ID);
        }
        if params.highest_priority > LOWEST_PRIORITY {
            return Err(ResultCode::INVALID_PRIORITY);
        }
        let pid = self.next_pid;
        self.next_pid += 1;

        let seed = splitmix64(self.config.aslr_seed ^ pid);
        let mut space = AddressSpace::new(pid, self.memory.clone(), params.pool, seed);
        for observer in &self.observers {
            space.add_observer(observer.clone());
        }
        let limits = params.resource_limits.unwrap_or(self.config.resource_limits);
        let resource_limit = self
            .objects
            .insert(KObject::ResourceLimit(ResourceLimit::new(&limits)));

        let process = Process {
            pid,
            name: params.name.clone(),
            program_id: params.program_id,
            state: ProcessState::Created,
            address_space: Arc::new(RwLock::new(space)),
            handles: HandleTable::new(self.config.handle_table_size),
            resource_limit,
            threads: Vec::new(),
            waiters: WaitQueue::new(),
            signaled: false,
            tls_pages: Vec::new(),
            ideal_core: params.ideal_core,
            core_mask: params.core_mask,
            highest_priority: params.highest_priority,
            address_waiters: Vec::new(),
            condition_waiters: Vec::new(),
            heap_charged: 0,
            entropy: [
                splitmix64(seed),
                splitmix64(seed + 1),
                splitmix64(seed + 2),
                splitmix64(seed + 3),
            ],
        };
        let id = self.objects.insert(KObject::Process(process));
        self.processes.insert(pid, id);
        info!("created process {} ({})", pid, params.name);
        Ok(id)
    }

    fn allocate_tls(&mut self, process: ObjectId) -> Result<VAddr, ResultCode> {
        let p = self
            .objects
            .process_mut(process)
            .ok_or(ResultCode::INVALID_HANDLE)?;
        if let Some(slot) = p.find_tls_slot() {
            read_space(&p.address_space).write(slot, &[0u8; TLS_SLOT_SIZE as usize])?;
            return Ok(slot);
        }
        let page = write_space(&p.address_space).allocate_and_map_anywhere(
            RegionKind::KernelMap,
            1,
            MemoryState::ThreadLocal,
            MemoryPermission::READ_WRITE,
        )?;
        let mut tls = TlsPage::new(page);
        let slot = tls.take_slot().ok_or(ResultCode::OUT_OF_MEMORY)?;
        p.tls_pages.push(tls);
        Ok(slot)
    }

    fn free_tls(&mut self, process: ObjectId, slot: VAddr) {
        let Some(p) = self.objects.process_mut(process) else {
            return;
        };
        if let Some(page) = p.release_tls_slot(slot) {
            if let Err(rc) = write_space(&p.address_space).unmap_pages(page, 1, MemoryState::ThreadLocal) {
                debug!("releasing TLS page 0x{:x}: {}", page, rc);
            }
        }
    }

    /// Creates a thread in the Initialized state. `core` -2 means the
    /// process's ideal core.
    pub fn create_thread(
        &mut self,
        process: ObjectId,
        entry: VAddr,
        arg: u64,
        stack_top: VAddr,
        priority: u32,
        core: i32,
    ) -> Result<ObjectId, ResultCode> {
        let p = self.objects.process(process).ok_or(ResultCode::INVALID_HANDLE)?;
        if !matches!(p.state, ProcessState::Created | ProcessState::Running) {
            return Err(ResultCode::TERMINATION_REQUESTED);
        }
        if priority > LOWEST_PRIORITY as u32 || priority < p.highest_priority as u32 {
            return Err(ResultCode::INVALID_PRIORITY);
        }
        let core = match core {
            -2 => p.ideal_core,
            c if c < 0 => return Err(ResultCode::INVALID_CORE_ID),
            c => c as usize,
        };
        p.check_core(core)?;
        if core >= self.scheduler.num_cores() {
            return Err(ResultCode::INVALID_CORE_ID);
        }
        let (pid, limit) = (p.pid, p.resource_limit);

        let reserved = self
            .objects
            .resource_limit_mut(limit)
            .map_or(false, |l| l.reserve(LimitableResource::Threads, 1));
        if !reserved {
            return Err(ResultCode::LIMIT_REACHED);
        }
        let tls = match self.allocate_tls(process) {
            Ok(tls) => tls,
            Err(rc) => {
                if let Some(l) = self.objects.resource_limit_mut(limit) {
                    l.release(LimitableResource::Threads, 1);
                }
                return Err(rc);
            }
        };

        let tid = self.next_tid;
        self.next_tid += 1;
        let context = ThreadContext::new(entry, stack_top, arg, tls);
        let thread = Thread::new(tid, process, pid, priority as u8, core, context, tls);
        let id = self.objects.insert(KObject::Thread(thread));
        if let Some(p) = self.objects.process_mut(process) {
            p.threads.push(id);
        }
        debug!("process {}: created thread {} at 0x{:x}, priority {}", pid, tid, entry, priority);
        Ok(id)
    }

    pub fn start_thread(&mut self, thread: ObjectId) -> Result<(), ResultCode> {
        let t = self.objects.thread(thread).ok_or(ResultCode::INVALID_HANDLE)?;
        if t.state != ThreadState::Initialized {
            return Err(ResultCode::INVALID_STATE);
        }
        let process = t.process;
        if let Some(p) = self.objects.process_mut(process) {
            if p.state == ProcessState::Created {
                p.state = ProcessState::Running;
            }
        }
        self.make_ready(thread);
        Ok(())
    }

    /// Terminates a thread that is not executing on a core right now.
    pub fn exit_thread(&mut self, thread: ObjectId) {
        let Some(t) = self.objects.thread_mut(thread) else {
            return;
        };
        if !t.is_alive() {
            return;
        }
        let (process, tls, tid) = (t.process, t.tls, t.tid);
        let kind = t.wait.take();
        if let Some(key) = t.timer.take() {
            self.timers.cancel(key);
        }
        if let Some(kind) = &kind {
            self.unlink_wait(thread, kind);
        }
        self.scheduler.remove(thread);
        if let Some(t) = self.objects.thread_mut(thread) {
            t.state = ThreadState::Terminated;
            t.signaled = true;
        }
        debug!("thread {} exited", tid);
        self.signal_object(thread);

        let limit = self.objects.process(process).map(|p| p.resource_limit);
        if let Some(l) = limit.and_then(|l| self.objects.resource_limit_mut(l)) {
            l.release(LimitableResource::Threads, 1);
        }
        self.free_tls(process, tls);
        let last = match self.objects.process_mut(process) {
            Some(p) => {
                p.threads.retain(|&t| t != thread);
                p.threads.is_empty() && p.state != ProcessState::Created
            }
            None => false,
        };
        if last {
            self.finish_process(process);
        }
        self.close_object(thread);
    }

    /// Starts tearing a process down. Threads running on other cores are
    /// interrupted and exit at their next kernel entry; `current` is the
    /// thread doing the call, which may exit right away.
    pub fn terminate_process(&mut self, process: ObjectId, current: Option<ObjectId>) {
        let Some(p) = self.objects.process_mut(process) else {
            return;
        };
        if matches!(p.state, ProcessState::Exiting | ProcessState::Terminated) {
            return;
        }
        p.state = ProcessState::Exiting;
        let threads = p.threads.clone();
        info!("terminating process {}", p.pid);
        if threads.is_empty() {
            self.finish_process(process);
            return;
        }
        for thread in threads {
            let running = self
                .objects
                .thread(thread)
                .map_or(false, |t| t.state == ThreadState::Running);
            if running && Some(thread) != current {
                if let Some(t) = self.objects.thread_mut(thread) {
                    t.terminate_requested = true;
                }
                self.scheduler.interrupt(thread);
            } else {
                self.exit_thread(thread);
            }
        }
    }

    fn finish_process(&mut self, process: ObjectId) {
        let Some(p) = self.objects.process_mut(process) else {
            return;
        };
        if p.state == ProcessState::Terminated {
            return;
        }
        p.state = ProcessState::Terminated;
        p.signaled = true;
        let pid = p.pid;
        let handles = p.handles.drain();
        let space = p.address_space.clone();
        for object in handles {
            self.close_object(object);
        }
        write_space(&space).finalize();
        self.signal_object(process);
        self.processes.remove(&pid);
        self.events.push_back(KernelEvent::ProcessExited { pid });
        info!("process {} exited", pid);
        self.close_object(process);
    }

    /// Logs and publishes a fatal error for the process running `thread`,
    /// then terminates that process.
    pub fn report_fatal(&mut self, thread: ObjectId, kind: FatalKind) {
        let Some(t) = self.objects.thread(thread) else {
            return;
        };
        let (pid, tid) = (t.pid, t.tid);
        let registers = Box::new(t.context.clone());
        error!(
            "process {} thread {}: {} (pc=0x{:x}, lr=0x{:x}, sp=0x{:x})",
            pid, tid, kind, registers.pc, registers.x[30], registers.sp
        );
        self.events.push_back(KernelEvent::Fatal { pid, kind, registers });
        if let Ok(process) = self.process_of(thread) {
            self.terminate_process(process, Some(thread));
        }
    }

    pub fn thread_count(&self) -> usize {
        self.objects.count(ObjectKind::Thread)
    }

    pub(crate) fn charge_heap(&mut self, process: ObjectId, size: u64) -> Result<(), ResultCode> {
        let p = self.objects.process(process).ok_or(ResultCode::INVALID_HANDLE)?;
        let (limit, charged) = (p.resource_limit, p.heap_charged);
        let l = self
            .objects
            .resource_limit_mut(limit)
            .ok_or(ResultCode::INVALID_HANDLE)?;
        if size > charged {
            if !l.reserve(LimitableResource::PhysicalMemory, (size - charged) as i64) {
                return Err(ResultCode::LIMIT_REACHED);
            }
        } else {
            l.release(LimitableResource::PhysicalMemory, (charged - size) as i64);
        }
        if let Some(p) = self.objects.process_mut(process) {
            p.heap_charged = size;
        }
        Ok(())
    }

    /// Allocates and maps the main stack, creates the main thread and
    /// starts it. The thread gets its own handle in x1.
    pub fn start_process(
        &mut self,
        process: ObjectId,
        entry: VAddr,
        priority: u32,
        stack_size: u64,
    ) -> Result<ObjectId, ResultCode> {
        let space = self.address_space(process)?;
        let pages = (stack_size.max(PAGE_SIZE) / PAGE_SIZE) as usize;
        let stack = write_space(&space).allocate_and_map_anywhere(
            RegionKind::Stack,
            pages,
            MemoryState::Stack,
            MemoryPermission::READ_WRITE,
        )?;
        let stack_top = stack + pages as u64 * PAGE_SIZE;
        let thread = match self.create_thread(process, entry, 0, stack_top, priority, -2) {
            Ok(thread) => thread,
            Err(rc) => {
                let _ = write_space(&space).unmap_pages(stack, pages, MemoryState::Stack);
                return Err(rc);
            }
        };
        let handle = self.add_handle(process, thread)?;
        if let Some(t) = self.objects.thread_mut(thread) {
            t.context.x[1] = handle.raw() as u64;
        }
        self.start_thread(thread)?;
        Ok(thread)
    }
}
