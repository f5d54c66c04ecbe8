#[path = "common/machine.rs"]
mod machine;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cpu::{Executor, ExecutorFactory, GuestMemory, HaltReason, HaltSignal, ThreadContext};
use kernel::{Kernel, KernelConfig, ProcessParams};
use machine::{small_pools, CODE, CODE_SIZE, MAIN_PRIORITY};
use types::{MemoryPermission, MemoryState, VAddr};

/// Guest code that never traps: it spins until the kernel raises the halt
/// signal. Every slice notes the pc it started at.
struct Spinner {
    halt: HaltSignal,
    context: ThreadContext,
    started: Arc<Mutex<BTreeSet<VAddr>>>,
}

impl Executor for Spinner {
    fn execute(&mut self) -> HaltReason {
        self.started.lock().unwrap().insert(self.context.pc);
        while !self.halt.take() {
            thread::yield_now();
        }
        HaltReason::BreakLoop
    }

    fn get_reg(&self, index: usize) -> u64 {
        self.context.x[index]
    }

    fn set_reg(&mut self, index: usize, value: u64) {
        self.context.x[index] = value;
    }

    fn get_pc(&self) -> u64 {
        self.context.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.context.pc = pc;
    }

    fn get_fpcr(&self) -> u32 {
        self.context.fpcr
    }

    fn set_fpcr(&mut self, value: u32) {
        self.context.fpcr = value;
    }

    fn svc_number(&self) -> u32 {
        0
    }

    fn invalidate_cache_range(&mut self, _addr: VAddr, _size: u64) {}

    fn set_memory(&mut self, _memory: Arc<dyn GuestMemory>) {}

    fn load_context(&mut self, ctx: &ThreadContext) {
        self.context = ctx.clone();
    }

    fn save_context(&self, ctx: &mut ThreadContext) {
        *ctx = self.context.clone();
    }
}

struct SpinnerFactory(Arc<Mutex<BTreeSet<VAddr>>>);

impl ExecutorFactory for SpinnerFactory {
    fn create(&self, _core: usize, halt: HaltSignal) -> Box<dyn Executor> {
        Box::new(Spinner {
            halt,
            context: ThreadContext::default(),
            started: self.0.clone(),
        })
    }
}

fn spawn_spinner(kernel: &Kernel, entry: VAddr) {
    let params = ProcessParams {
        core_mask: 1,
        ..Default::default()
    };
    let pid = kernel.create_process(&params).expect("create process");
    kernel
        .map_segment(pid, CODE, &[], CODE_SIZE, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .expect("map code");
    kernel
        .start_process(pid, entry, MAIN_PRIORITY, 0x4000)
        .expect("start process");
}

#[test]
fn equal_priority_threads_share_a_core_that_never_traps() {
    let started = Arc::new(Mutex::new(BTreeSet::new()));
    let kernel = Kernel::new(KernelConfig {
        num_cores: 1,
        quantum_us: 1000,
        pool_sizes: small_pools(),
        ..Default::default()
    });
    let workers = kernel
        .start(Arc::new(SpinnerFactory(started.clone())))
        .expect("spawn cores");

    let (first, second) = (CODE, CODE + 0x100);
    spawn_spinner(&kernel, first);
    spawn_spinner(&kernel, second);

    let deadline = Instant::now() + Duration::from_secs(5);
    while started.lock().unwrap().len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    kernel.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
    let started = started.lock().unwrap().clone();
    assert_eq!(started, BTreeSet::from([first, second]));
}
