//! Emulated kernel: objects and handles, the thread scheduler, supervisor
//! calls and the IPC plumbing between guest processes and host services.
//!
//! [`Kernel`] is the host's entry point. It owns one [`KernelState`] behind
//! a mutex and one worker thread per emulated core; guest code runs through
//! the [`cpu::Executor`] each worker is given.

pub mod arena;
pub mod config;
mod core_worker;
pub mod event;
pub mod handle_table;
pub mod hle;
pub mod ipc;
mod kernel;
pub mod object;
pub mod process;
pub mod report;
pub mod resource_limit;
pub mod scheduler;
pub mod shared_memory;
pub mod state;
pub mod svc;
pub mod sync;
pub mod thread;
pub mod timer;

pub use arena::ObjectId;
pub use config::KernelConfig;
pub use hle::{HleEvent, HleReply, HleRequest, ObjectRef, SessionKey};
pub use ipc::message::{BufferDescriptor, CommandType, HipcMessage, MESSAGE_BUFFER_SIZE};
pub use kernel::Kernel;
pub use report::{FatalKind, KernelEvent};
pub use resource_limit::{LimitableResource, ResourceLimitValues};
pub use state::{KernelState, ProcessParams};
pub use svc::SvcId;
