//! Services the host provides out of the box.

use std::sync::Arc;

use log::info;
use serde::Deserialize;
use types::ResultCode;

use crate::manager::{factory, ServiceManager};

pub mod acc;
pub mod fatal;
pub mod hid;
pub mod lm;
pub mod sm;

use acc::{AccountService, UserProfile};
use fatal::FatalService;
use hid::{HidService, HidShared};
use lm::{LmService, LogSink};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub users: Vec<UserProfile>,
    /// Session limit of every built-in port.
    pub max_sessions: u32,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            users: vec![UserProfile::default()],
            max_sessions: 64,
        }
    }
}

/// Host-side state of the built-ins that outlives any one session.
pub struct BuiltinServices {
    pub log: LogSink,
    pub hid: Arc<HidShared>,
}

/// Registers `sm:` as a named port plus every service behind it.
pub fn register_builtin(
    manager: &Arc<ServiceManager>,
    config: &ServicesConfig,
) -> Result<BuiltinServices, ResultCode> {
    let max = config.max_sessions;

    let registry = Arc::downgrade(manager);
    manager.register_named_hle(
        sm::NAME,
        max,
        factory(move || sm::UserInterface::new(registry.clone())),
    )?;

    manager.register_hle(fatal::NAME, max, factory(|| FatalService))?;

    let log = LogSink::new();
    let sink = log.clone();
    manager.register_hle(lm::NAME, max, factory(move || LmService::new(sink.clone())))?;

    let users = Arc::new(config.users.clone());
    manager.register_hle(acc::NAME, max, factory(move || AccountService::new(users.clone())))?;

    let hid = HidShared::new(manager.kernel().clone())?;
    let shared = hid.clone();
    manager.register_hle(hid::NAME, max, factory(move || HidService::new(shared.clone())))?;

    info!("{} built-in services registered", manager.names().len());
    Ok(BuiltinServices { log, hid })
}
