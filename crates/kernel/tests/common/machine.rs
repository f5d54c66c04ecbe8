#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpu::{Op, Script, ScriptBook, ScriptedExecutorFactory, Trace};
use kernel::{Kernel, KernelConfig, KernelEvent, ProcessParams, ResourceLimitValues};
use memory::layout::AddressSpaceLayout;
use memory::PoolSizes;
use types::{MemoryPermission, MemoryState, VAddr};

pub const CODE: VAddr = AddressSpaceLayout::CODE_START;
pub const CODE_SIZE: u64 = 0x8000;
pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const MAIN_PRIORITY: u32 = 44;

/// Scratch area inside the thread-local region, past the message buffer.
pub const SCRATCH: u64 = 0x100;

/// A kernel with running cores and a scripted CPU.
pub struct Machine {
    pub kernel: Kernel,
    pub book: ScriptBook,
    pub trace: Trace,
    workers: Vec<JoinHandle<()>>,
}

pub fn small_pools() -> PoolSizes {
    PoolSizes {
        application: 0x100_0000,
        applet: 0x10_0000,
        system: 0x40_0000,
        system_non_secure: 0x10_0000,
    }
}

impl Machine {
    pub fn new(num_cores: usize) -> Self {
        Self::with_config(KernelConfig {
            num_cores,
            pool_sizes: small_pools(),
            ..Default::default()
        })
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let kernel = Kernel::new(config);
        let book = ScriptBook::new();
        let trace = Trace::new();
        let factory = ScriptedExecutorFactory::new(book.clone(), trace.clone());
        let workers = kernel.start(Arc::new(factory)).expect("spawn cores");
        Self {
            kernel,
            book,
            trace,
            workers,
        }
    }

    /// Creates a process with a code segment and runs `main` as its main
    /// thread. Other scripts must already be in the book.
    pub fn spawn(&self, main: Script) -> u64 {
        self.spawn_with_limits(main, None)
    }

    pub fn spawn_with_limits(&self, main: Script, limits: Option<ResourceLimitValues>) -> u64 {
        let params = ProcessParams {
            resource_limits: limits,
            ..Default::default()
        };
        let pid = self.kernel.create_process(&params).expect("create process");
        self.kernel
            .map_segment(
                pid,
                CODE,
                &[],
                CODE_SIZE,
                MemoryState::Code,
                MemoryPermission::READ_EXECUTE,
            )
            .expect("map code");
        let entry = self.book.add(main);
        self.kernel
            .start_process(pid, entry, MAIN_PRIORITY, 0x4000)
            .expect("start process");
        pid
    }

    pub fn run_to_exit(&self, pid: u64) {
        assert!(
            self.kernel.wait_for_exit(pid, TIMEOUT),
            "process {} did not exit",
            pid
        );
    }

    /// First fatal report, skipping other events.
    pub fn next_fatal(&self) -> Option<KernelEvent> {
        let deadline = Instant::now() + TIMEOUT;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.kernel.next_event(left) {
                Some(event @ KernelEvent::Fatal { .. }) => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }

    /// Values recorded under `tag`, one row per record.
    pub fn values(&self, tag: &str) -> Vec<Vec<u64>> {
        self.trace.tagged(tag).into_iter().map(|e| e.values).collect()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.kernel.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Script at `CODE + offset`.
pub fn script(offset: u64) -> Script {
    Script::new(CODE + offset)
}

/// Copies `regs` (dst, src), sets `values`, then traps.
pub fn svc_with(script: &mut Script, id: u32, regs: &[(usize, usize)], values: &[(usize, u64)]) {
    for &(dst, src) in regs {
        script.mov(dst, src);
    }
    for &(reg, value) in values {
        script.set(reg, value);
    }
    script.op(Op::Svc { id });
}

/// Writes the handle in `handle_reg` to scratch and points x1 at it.
pub fn handle_list(script: &mut Script, handle_reg: usize) {
    script
        .op(Op::Tls { dst: 28 })
        .op(Op::Store32 { base: 28, offset: SCRATCH, src: handle_reg })
        .op(Op::Add { dst: 1, src: 28, imm: SCRATCH });
}
