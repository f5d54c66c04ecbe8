//! One emulation session: a kernel, its cores, the service thread and
//! whatever programs were loaded into it.

pub mod config;
pub mod error;
pub mod loader;
pub mod system;

pub use config::SystemConfig;
pub use error::{ConfigError, LoaderError, SystemError};
pub use loader::{ProgramImage, Segment};
pub use system::System;
