//! Host-side system services.
//!
//! Guests reach these through ordinary IPC: a request sent on a session to
//! an HLE port is handed to the service thread, which decodes its CMIF
//! command, runs the matching handler and replies through the kernel.

pub mod cmif;
pub mod context;
pub mod interface;
pub mod manager;
pub mod server;
pub mod services;

pub use context::RequestContext;
pub use interface::{CommandTable, HandlerResult, SessionHandler};
pub use manager::{factory, HandlerFactory, ServiceManager};
pub use server::{spawn, ServiceDispatcher};
pub use services::{register_builtin, BuiltinServices, ServicesConfig};
