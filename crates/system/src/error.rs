use std::io;

use thiserror::Error;
use types::{ResultCode, VAddr};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("not a loadable ELF: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error("image has no loadable segments")]
    Empty,
    #[error("segment at {addr:#x} is both writable and executable")]
    WritableCode { addr: VAddr },
    #[error("segment at {addr:#x} overlaps the previous one")]
    Overlap { addr: VAddr },
    #[error("segment at {addr:#x} extends past the file")]
    Truncated { addr: VAddr },
    #[error("entry point {entry:#x} is not in an executable segment")]
    BadEntry { entry: VAddr },
    #[error("kernel refused the image: {0}")]
    Kernel(#[from] ResultCode),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error("cannot spawn host threads: {0}")]
    Spawn(#[from] io::Error),
    #[error("service setup failed: {0}")]
    Service(ResultCode),
    #[error("system already started")]
    AlreadyStarted,
    #[error("system not started")]
    NotStarted,
    #[error("process {pid} still running after the timeout")]
    TimedOut { pid: u64 },
}
