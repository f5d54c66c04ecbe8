//! A deterministic stand-in for the JIT.
//!
//! Guest "programs" are lists of [`Op`]s registered in a [`ScriptBook`] at a
//! base address. Every op occupies four bytes of address space, so the saved
//! PC of a thread points at the op it will run next and context switches work
//! exactly as with real code. Running past the last op of a script issues
//! `ExitThread`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use log::trace;
use serde::{Deserialize, Serialize};
use types::VAddr;

use crate::context::ThreadContext;
use crate::executor::{Executor, ExecutorFactory, GuestMemory, HaltReason};
use crate::halt::HaltSignal;

pub const OP_SIZE: u64 = 4;
/// Supervisor call issued when a script runs off its end.
pub const EXIT_THREAD_SVC: u32 = 0x0A;
/// Ops run per `execute` call before the executor yields with `BreakLoop`.
pub const DEFAULT_SLICE: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Set { reg: usize, value: u64 },
    Mov { dst: usize, src: usize },
    Add { dst: usize, src: usize, imm: u64 },
    /// dst = tpidrro_el0 (the thread-local region).
    Tls { dst: usize },
    Store32 { base: usize, offset: u64, src: usize },
    Store64 { base: usize, offset: u64, src: usize },
    StoreBytes { base: usize, offset: u64, data: Vec<u8> },
    Load32 { dst: usize, base: usize, offset: u64 },
    Load64 { dst: usize, base: usize, offset: u64 },
    Svc { id: u32 },
    Record { tag: String, regs: Vec<usize> },
    RecordMemory { tag: String, base: usize, offset: u64, len: usize },
    Jump { target: VAddr },
    JumpIfEq { reg: usize, value: u64, target: VAddr },
    JumpIfNe { reg: usize, value: u64, target: VAddr },
    Fault { addr: VAddr },
    Undefined,
    Brk,
}

/// Builder that tracks addresses so scripts can jump to labels.
#[derive(Debug, Clone)]
pub struct Script {
    base: VAddr,
    ops: Vec<Op>,
}

impl Script {
    pub fn new(base: VAddr) -> Self {
        Self { base, ops: Vec::new() }
    }

    pub fn base(&self) -> VAddr {
        self.base
    }

    /// Address of the next op pushed.
    pub fn here(&self) -> VAddr {
        self.base + self.ops.len() as u64 * OP_SIZE
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set(&mut self, reg: usize, value: u64) -> &mut Self {
        self.op(Op::Set { reg, value })
    }

    pub fn mov(&mut self, dst: usize, src: usize) -> &mut Self {
        self.op(Op::Mov { dst, src })
    }

    /// Loads `args` into x0.. and traps with `svc #id`.
    pub fn svc(&mut self, id: u32, args: &[u64]) -> &mut Self {
        for (reg, value) in args.iter().enumerate() {
            self.set(reg, *value);
        }
        self.op(Op::Svc { id })
    }

    pub fn record(&mut self, tag: &str, regs: &[usize]) -> &mut Self {
        self.op(Op::Record {
            tag: tag.to_string(),
            regs: regs.to_vec(),
        })
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

enum Fetch {
    Op(Op),
    End,
    Missing,
}

/// All scripts known to the emulated machine, keyed by base address.
#[derive(Debug, Clone, Default)]
pub struct ScriptBook {
    scripts: Arc<RwLock<BTreeMap<VAddr, Arc<Vec<Op>>>>>,
}

impl ScriptBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, base: VAddr, ops: Vec<Op>) {
        self.scripts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(base, Arc::new(ops));
    }

    pub fn add(&self, script: Script) -> VAddr {
        let base = script.base();
        self.insert(base, script.into_ops());
        base
    }

    fn fetch(&self, pc: VAddr) -> Fetch {
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        let Some((base, ops)) = scripts.range(..=pc).next_back() else {
            return Fetch::Missing;
        };
        let offset = pc - base;
        if offset % OP_SIZE != 0 {
            return Fetch::Missing;
        }
        let index = (offset / OP_SIZE) as usize;
        match ops.get(index) {
            Some(op) => Fetch::Op(op.clone()),
            None if index == ops.len() => Fetch::End,
            None => Fetch::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub core: usize,
    pub tag: String,
    pub values: Vec<u64>,
    pub bytes: Vec<u8>,
}

/// Shared log of `Record` ops, in execution order.
#[derive(Debug, Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<TraceEntry>>>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: TraceEntry) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Entries recorded under `tag`.
    pub fn tagged(&self, tag: &str) -> Vec<TraceEntry> {
        self.entries().into_iter().filter(|e| e.tag == tag).collect()
    }

    /// Tags in the order they were recorded.
    pub fn tags(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.tag).collect()
    }
}

pub struct ScriptedExecutor {
    core: usize,
    halt: HaltSignal,
    book: ScriptBook,
    trace: Trace,
    slice: usize,
    ctx: ThreadContext,
    memory: Option<Arc<dyn GuestMemory>>,
    svc: u32,
    invalidated: Vec<(VAddr, u64)>,
}

impl ScriptedExecutor {
    pub fn new(core: usize, halt: HaltSignal, book: ScriptBook, trace: Trace, slice: usize) -> Self {
        Self {
            core,
            halt,
            book,
            trace,
            slice,
            ctx: ThreadContext::default(),
            memory: None,
            svc: 0,
            invalidated: Vec::new(),
        }
    }

    pub fn invalidated_ranges(&self) -> &[(VAddr, u64)] {
        &self.invalidated
    }

    fn read(&self, addr: VAddr, out: &mut [u8]) -> Result<(), HaltReason> {
        match &self.memory {
            Some(mem) => mem.read(addr, out).map_err(|_| HaltReason::DataAbort { addr }),
            None => Err(HaltReason::DataAbort { addr }),
        }
    }

    fn write(&self, addr: VAddr, data: &[u8]) -> Result<(), HaltReason> {
        match &self.memory {
            Some(mem) => mem.write(addr, data).map_err(|_| HaltReason::DataAbort { addr }),
            None => Err(HaltReason::DataAbort { addr }),
        }
    }

    fn reg(&self, index: usize) -> u64 {
        self.ctx.x.get(index).copied().unwrap_or(0)
    }

    fn set(&mut self, index: usize, value: u64) {
        if let Some(r) = self.ctx.x.get_mut(index) {
            *r = value;
        }
    }

    /// Runs one op. `Ok(Some(reason))` stops execution.
    fn step(&mut self, op: Op) -> Result<Option<HaltReason>, HaltReason> {
        let pc = self.ctx.pc;
        self.ctx.pc += OP_SIZE;
        match op {
            Op::Set { reg, value } => self.set(reg, value),
            Op::Mov { dst, src } => self.set(dst, self.reg(src)),
            Op::Add { dst, src, imm } => self.set(dst, self.reg(src).wrapping_add(imm)),
            Op::Tls { dst } => self.set(dst, self.ctx.tpidrro_el0),
            Op::Store32 { base, offset, src } => {
                let addr = self.reg(base) + offset;
                self.write(addr, &(self.reg(src) as u32).to_le_bytes())?;
            }
            Op::Store64 { base, offset, src } => {
                let addr = self.reg(base) + offset;
                self.write(addr, &self.reg(src).to_le_bytes())?;
            }
            Op::StoreBytes { base, offset, data } => {
                self.write(self.reg(base) + offset, &data)?;
            }
            Op::Load32 { dst, base, offset } => {
                let mut buf = [0u8; 4];
                self.read(self.reg(base) + offset, &mut buf)?;
                self.set(dst, u32::from_le_bytes(buf) as u64);
            }
            Op::Load64 { dst, base, offset } => {
                let mut buf = [0u8; 8];
                self.read(self.reg(base) + offset, &mut buf)?;
                self.set(dst, u64::from_le_bytes(buf));
            }
            Op::Svc { id } => {
                self.svc = id;
                return Ok(Some(HaltReason::SupervisorCall));
            }
            Op::Record { tag, regs } => {
                let values = regs.iter().map(|&r| self.reg(r)).collect();
                self.trace.push(TraceEntry {
                    core: self.core,
                    tag,
                    values,
                    bytes: Vec::new(),
                });
            }
            Op::RecordMemory { tag, base, offset, len } => {
                let mut bytes = vec![0u8; len];
                self.read(self.reg(base) + offset, &mut bytes)?;
                self.trace.push(TraceEntry {
                    core: self.core,
                    tag,
                    values: Vec::new(),
                    bytes,
                });
            }
            Op::Jump { target } => self.ctx.pc = target,
            Op::JumpIfEq { reg, value, target } => {
                if self.reg(reg) == value {
                    self.ctx.pc = target;
                }
            }
            Op::JumpIfNe { reg, value, target } => {
                if self.reg(reg) != value {
                    self.ctx.pc = target;
                }
            }
            Op::Fault { addr } => {
                self.ctx.pc = pc;
                return Err(HaltReason::DataAbort { addr });
            }
            Op::Undefined => {
                self.ctx.pc = pc;
                return Err(HaltReason::UndefinedInstruction { pc });
            }
            Op::Brk => return Err(HaltReason::Breakpoint { pc }),
        }
        Ok(None)
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&mut self) -> HaltReason {
        for _ in 0..self.slice {
            if self.halt.take() {
                return HaltReason::BreakLoop;
            }
            let op = match self.book.fetch(self.ctx.pc) {
                Fetch::Op(op) => op,
                Fetch::End => {
                    trace!("core {}: script ended at 0x{:x}", self.core, self.ctx.pc);
                    self.svc = EXIT_THREAD_SVC;
                    return HaltReason::SupervisorCall;
                }
                Fetch::Missing => return HaltReason::PrefetchAbort { addr: self.ctx.pc },
            };
            match self.step(op) {
                Ok(Some(reason)) | Err(reason) => return reason,
                Ok(None) => {}
            }
        }
        HaltReason::BreakLoop
    }

    fn get_reg(&self, index: usize) -> u64 {
        self.reg(index)
    }

    fn set_reg(&mut self, index: usize, value: u64) {
        self.set(index, value);
    }

    fn get_pc(&self) -> u64 {
        self.ctx.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.ctx.pc = pc;
    }

    fn get_fpcr(&self) -> u32 {
        self.ctx.fpcr
    }

    fn set_fpcr(&mut self, value: u32) {
        self.ctx.fpcr = value;
    }

    fn svc_number(&self) -> u32 {
        self.svc
    }

    fn invalidate_cache_range(&mut self, addr: VAddr, size: u64) {
        self.invalidated.push((addr, size));
    }

    fn set_memory(&mut self, memory: Arc<dyn GuestMemory>) {
        self.memory = Some(memory);
    }

    fn load_context(&mut self, ctx: &ThreadContext) {
        self.ctx = ctx.clone();
    }

    fn save_context(&self, ctx: &mut ThreadContext) {
        *ctx = self.ctx.clone();
    }
}

/// Creates [`ScriptedExecutor`]s sharing one book and one trace.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutorFactory {
    pub book: ScriptBook,
    pub trace: Trace,
    pub slice: Option<usize>,
}

impl ScriptedExecutorFactory {
    pub fn new(book: ScriptBook, trace: Trace) -> Self {
        Self { book, trace, slice: None }
    }
}

impl ExecutorFactory for ScriptedExecutorFactory {
    fn create(&self, core: usize, halt: HaltSignal) -> Box<dyn Executor> {
        Box::new(ScriptedExecutor::new(
            core,
            halt,
            self.book.clone(),
            self.trace.clone(),
            self.slice.unwrap_or(DEFAULT_SLICE),
        ))
    }
}
