use cpu::ThreadContext;
use types::{Handle, VAddr};

use crate::arena::ObjectId;
use crate::sync::WaitQueue;
use crate::timer::TimerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Initialized,
    Ready,
    Running,
    Waiting,
    Terminated,
}

/// What a waiting thread is blocked on. The kernel completes the wait by
/// writing the outcome into the saved context and making the thread ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitKind {
    Sleep,
    /// WaitSynchronization; x1 receives the index of the signaled object.
    Synchronization { objects: Vec<ObjectId> },
    /// ReplyAndReceive; a signaled server session is received on wake.
    Receive { objects: Vec<ObjectId> },
    /// SendSyncRequest waiting for the reply to `request`.
    IpcReply { session: ObjectId, request: u64 },
    /// WaitForAddress.
    Address { addr: VAddr },
    /// ArbitrateLock; waiting for `owner` to hand over the mutex at `addr`.
    Mutex { addr: VAddr, owner: ObjectId },
    /// WaitProcessWideKeyAtomic.
    ConditionVariable { key: VAddr, mutex: VAddr },
}

#[derive(Debug)]
pub struct Thread {
    pub tid: u64,
    pub process: ObjectId,
    pub pid: u64,
    pub state: ThreadState,
    pub wait: Option<WaitKind>,
    pub priority: u8,
    pub ideal_core: usize,
    pub affinity: u64,
    pub context: ThreadContext,
    pub tls: VAddr,
    /// Threads waiting for this one to exit.
    pub waiters: WaitQueue,
    pub signaled: bool,
    /// CancelSynchronization arrived while not waiting.
    pub cancel_pending: bool,
    pub timer: Option<TimerKey>,
    /// The owning process is terminating; stop at the next kernel entry.
    pub terminate_requested: bool,
    /// Value written to a mutex word when this thread acquires it.
    pub mutex_tag: Handle,
    pub mutex_waiters: Vec<ObjectId>,
    pub ticks: u64,
}

impl Thread {
    pub fn new(
        tid: u64,
        process: ObjectId,
        pid: u64,
        priority: u8,
        ideal_core: usize,
        context: ThreadContext,
        tls: VAddr,
    ) -> Self {
        Self {
            tid,
            process,
            pid,
            state: ThreadState::Initialized,
            wait: None,
            priority,
            ideal_core,
            affinity: 1 << ideal_core,
            context,
            tls,
            waiters: WaitQueue::new(),
            signaled: false,
            cancel_pending: false,
            timer: None,
            terminate_requested: false,
            mutex_tag: Handle::INVALID,
            mutex_waiters: Vec::new(),
            ticks: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state != ThreadState::Terminated
    }
}
