//! CPU execution boundary.
//!
//! The kernel drives guest code through the [`Executor`] trait and never
//! looks at instructions itself. A core runs until the executor reports a
//! [`HaltReason`]; supervisor calls are then dispatched against the saved
//! registers and execution resumes.

pub mod context;
pub mod executor;
pub mod halt;
pub mod registers;
pub mod scripted;

pub use context::ThreadContext;
pub use executor::{Executor, ExecutorFactory, GuestMemory, HaltReason};
pub use halt::HaltSignal;
pub use registers::Register;
pub use scripted::{Op, Script, ScriptBook, ScriptedExecutor, ScriptedExecutorFactory, Trace, TraceEntry};
