#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpu::{Op, Script, ScriptBook, ScriptedExecutorFactory, Trace};
use kernel::{Kernel, KernelConfig, ProcessParams, SvcId};
use memory::layout::AddressSpaceLayout;
use memory::PoolSizes;
use service::cmif::CmifResponse;
use service::{ServiceDispatcher, ServiceManager};
use types::{MemoryPermission, MemoryState, VAddr};

pub const CODE: VAddr = AddressSpaceLayout::CODE_START;
pub const CODE_SIZE: u64 = 0x8000;
/// Read-write pages right after the code, for buffers.
pub const DATA: VAddr = CODE + CODE_SIZE;
pub const DATA_SIZE: u64 = 0x4000;
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Past the message buffer in the thread-local region.
const SCRATCH: u64 = 0x100;
/// Where the first handle of a reply with a handle descriptor lands.
pub const FIRST_REPLY_HANDLE: u64 = 0x0C;

/// A kernel with running cores, a scripted CPU and a service dispatcher
/// the test drives by hand.
pub struct Guest {
    pub kernel: Kernel,
    pub book: ScriptBook,
    pub trace: Trace,
    pub manager: Arc<ServiceManager>,
    pub dispatcher: ServiceDispatcher,
    workers: Vec<JoinHandle<()>>,
}

impl Guest {
    pub fn new() -> Self {
        let kernel = Kernel::new(KernelConfig {
            num_cores: 2,
            pool_sizes: PoolSizes {
                application: 0x100_0000,
                applet: 0x10_0000,
                system: 0x40_0000,
                system_non_secure: 0x10_0000,
            },
            ..Default::default()
        });
        let book = ScriptBook::new();
        let trace = Trace::new();
        let factory = ScriptedExecutorFactory::new(book.clone(), trace.clone());
        let workers = kernel.start(Arc::new(factory)).expect("spawn cores");
        let manager = ServiceManager::new(kernel.clone());
        let dispatcher = ServiceDispatcher::new(kernel.clone(), manager.clone());
        Self {
            kernel,
            book,
            trace,
            manager,
            dispatcher,
            workers,
        }
    }

    /// Starts a process running `main` with `data` at `DATA`.
    pub fn spawn(&self, main: Script, data: &[u8]) -> u64 {
        let pid = self
            .kernel
            .create_process(&ProcessParams::default())
            .expect("create process");
        self.kernel
            .map_segment(pid, CODE, &[], CODE_SIZE, MemoryState::Code, MemoryPermission::READ_EXECUTE)
            .expect("map code");
        self.kernel
            .map_segment(pid, DATA, data, DATA_SIZE, MemoryState::CodeData, MemoryPermission::READ_WRITE)
            .expect("map data");
        let entry = self.book.add(main);
        self.kernel.start_process(pid, entry, 44, 0x4000).expect("start process");
        pid
    }

    /// Handles `count` events on the test thread.
    pub fn serve(&mut self, count: usize) {
        for i in 0..count {
            assert!(self.dispatcher.poll(TIMEOUT), "event {} of {} never came", i + 1, count);
        }
    }

    pub fn run_to_exit(&self, pid: u64) {
        assert!(self.kernel.wait_for_exit(pid, TIMEOUT), "process {} did not exit", pid);
    }

    pub fn values(&self, tag: &str) -> Vec<Vec<u64>> {
        self.trace.tagged(tag).into_iter().map(|e| e.values).collect()
    }

    /// Reply recorded by `request` under `tag`.
    pub fn reply(&self, tag: &str) -> CmifResponse {
        let entries = self.trace.tagged(tag);
        let entry = entries.first().unwrap_or_else(|| panic!("no reply recorded as {}", tag));
        CmifResponse::parse(&entry.bytes).expect("well-formed reply")
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.kernel.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

pub fn id(svc: SvcId) -> u32 {
    svc.into()
}

pub fn script() -> Script {
    Script::new(CODE)
}

/// Connects to the named port `name`, leaving the session handle in `dst`.
pub fn connect(script: &mut Script, name: &str, dst: usize) {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    script
        .op(Op::Tls { dst: 28 })
        .op(Op::StoreBytes { base: 28, offset: SCRATCH, data: bytes })
        .op(Op::Add { dst: 1, src: 28, imm: SCRATCH })
        .op(Op::Svc { id: id(SvcId::ConnectToNamedPort) })
        .record(&format!("connect {}", name), &[0])
        .mov(dst, 1);
}

/// Sends `message` on the session in `handle`. The result lands under
/// `tag` and the reply under `tag` + " reply".
pub fn request(script: &mut Script, handle: usize, message: Vec<u8>, tag: &str) {
    script
        .op(Op::Tls { dst: 28 })
        .op(Op::StoreBytes { base: 28, offset: 0, data: message })
        .mov(0, handle)
        .op(Op::Svc { id: id(SvcId::SendSyncRequest) })
        .record(tag, &[0])
        .op(Op::RecordMemory {
            tag: format!("{} reply", tag),
            base: 28,
            offset: 0,
            len: 0x100,
        });
}

/// Loads the first handle of the last reply into `dst`.
pub fn take_reply_handle(script: &mut Script, dst: usize) {
    script
        .op(Op::Tls { dst: 28 })
        .op(Op::Load32 { dst, base: 28, offset: FIRST_REPLY_HANDLE });
}

pub fn exit(script: &mut Script) {
    script.svc(id(SvcId::ExitProcess), &[]);
}
