use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cpu::scripted::EXIT_THREAD_SVC;
use cpu::{
    Executor, ExecutorFactory, GuestMemory, HaltReason, HaltSignal, Op, Register, Script,
    ScriptBook, ScriptedExecutorFactory, ThreadContext, Trace,
};
use types::{ResultCode, VAddr};

#[derive(Default)]
struct FlatMemory(Mutex<HashMap<VAddr, u8>>);

impl GuestMemory for FlatMemory {
    fn read(&self, addr: VAddr, out: &mut [u8]) -> Result<(), ResultCode> {
        let mem = self.0.lock().unwrap();
        for (i, b) in out.iter_mut().enumerate() {
            *b = *mem.get(&(addr + i as u64)).ok_or(ResultCode::INVALID_POINTER)?;
        }
        Ok(())
    }

    fn write(&self, addr: VAddr, data: &[u8]) -> Result<(), ResultCode> {
        let mut mem = self.0.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            mem.insert(addr + i as u64, *b);
        }
        Ok(())
    }
}

fn executor(book: &ScriptBook, trace: &Trace, halt: HaltSignal) -> Box<dyn Executor> {
    ScriptedExecutorFactory::new(book.clone(), trace.clone()).create(0, halt)
}

#[test]
fn svc_traps_with_arguments_loaded() {
    let book = ScriptBook::new();
    let trace = Trace::new();
    let mut script = Script::new(0x1000);
    script.svc(0x45, &[7, 8]);
    book.add(script);

    let mut cpu = executor(&book, &trace, HaltSignal::new());
    cpu.load_context(&ThreadContext::new(0x1000, 0, 0, 0));
    assert_eq!(cpu.execute(), HaltReason::SupervisorCall);
    assert_eq!(cpu.svc_number(), 0x45);
    assert_eq!(cpu.get_reg(Register::X0.index()), 7);
    assert_eq!(cpu.get_reg(Register::X1.index()), 8);
    assert_eq!(cpu.get_pc(), 0x100C);

    // running off the end exits the thread
    assert_eq!(cpu.execute(), HaltReason::SupervisorCall);
    assert_eq!(cpu.svc_number(), EXIT_THREAD_SVC);
}

#[test]
fn context_round_trips_through_the_executor() {
    let book = ScriptBook::new();
    let trace = Trace::new();
    let mut script = Script::new(0x2000);
    script.set(19, 42).record("r", &[19]);
    book.add(script);

    let mut cpu = executor(&book, &trace, HaltSignal::new());
    let mut ctx = ThreadContext::new(0x2000, 0x9000, 0, 0x5000);
    cpu.load_context(&ctx);
    cpu.execute();
    cpu.save_context(&mut ctx);
    assert_eq!(ctx.x[19], 42);
    assert_eq!(ctx.sp, 0x9000);
    assert_eq!(trace.tagged("r")[0].values, vec![42]);
}

#[test]
fn raised_halt_signal_breaks_the_loop() {
    let book = ScriptBook::new();
    let trace = Trace::new();
    let mut script = Script::new(0x3000);
    let top = script.here();
    script.op(Op::Jump { target: top });
    book.add(script);

    let halt = HaltSignal::new();
    let mut cpu = executor(&book, &trace, halt.clone());
    cpu.load_context(&ThreadContext::new(0x3000, 0, 0, 0));
    halt.raise();
    assert_eq!(cpu.execute(), HaltReason::BreakLoop);
    assert!(!halt.is_raised());
    // without a signal the slice still runs out
    assert_eq!(cpu.execute(), HaltReason::BreakLoop);
}

#[test]
fn memory_ops_go_through_guest_memory() {
    let book = ScriptBook::new();
    let trace = Trace::new();
    let mut script = Script::new(0x4000);
    script
        .op(Op::Tls { dst: 9 })
        .set(10, 0xABCD)
        .op(Op::Store32 { base: 9, offset: 4, src: 10 })
        .op(Op::Load32 { dst: 11, base: 9, offset: 4 })
        .record("loaded", &[11]);
    book.add(script);

    let mut cpu = executor(&book, &trace, HaltSignal::new());
    cpu.set_memory(Arc::new(FlatMemory::default()));
    cpu.load_context(&ThreadContext::new(0x4000, 0, 0, 0x7000));
    cpu.execute();
    assert_eq!(trace.tagged("loaded")[0].values, vec![0xABCD]);
}

#[test]
fn faults_and_unknown_code_are_reported() {
    let book = ScriptBook::new();
    let trace = Trace::new();
    let mut script = Script::new(0x5000);
    script.op(Op::Fault { addr: 0xDEAD });
    book.add(script);

    let mut cpu = executor(&book, &trace, HaltSignal::new());
    cpu.load_context(&ThreadContext::new(0x5000, 0, 0, 0));
    assert_eq!(cpu.execute(), HaltReason::DataAbort { addr: 0xDEAD });

    cpu.set_pc(0x9_0000);
    assert_eq!(cpu.execute(), HaltReason::PrefetchAbort { addr: 0x9_0000 });
}
