use serde::{Deserialize, Serialize};
use types::VAddr;

use crate::registers::Register;

/// Saved CPU state of a guest thread.
///
/// This is the whole of a thread's register state while it is not on a
/// core; blocking supervisor calls write their results here before the
/// thread is resumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadContext {
    pub x: [u64; Register::NUM_GPRS],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u32,
    /// v0..v31 as (low, high) halves.
    pub v: Vec<[u64; 2]>,
    pub fpcr: u32,
    pub fpsr: u32,
    pub tpidr_el0: u64,
    /// Read-only thread pointer; holds the thread-local region address.
    pub tpidrro_el0: VAddr,
}

impl ThreadContext {
    pub fn new(entry: VAddr, stack_top: VAddr, arg: u64, tls: VAddr) -> Self {
        let mut ctx = Self {
            sp: stack_top,
            pc: entry,
            tpidrro_el0: tls,
            v: vec![[0; 2]; 32],
            ..Default::default()
        };
        ctx.x[0] = arg;
        ctx
    }

    pub fn reg(&self, r: Register) -> u64 {
        self.x[r.index()]
    }

    pub fn set_reg(&mut self, r: Register, value: u64) {
        self.x[r.index()] = value;
    }

    /// Supervisor-call arguments x0..x7.
    pub fn args(&self) -> [u64; Register::NUM_ARGS] {
        let mut args = [0u64; Register::NUM_ARGS];
        args.copy_from_slice(&self.x[..Register::NUM_ARGS]);
        args
    }
}
