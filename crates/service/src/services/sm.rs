//! `sm:`, the service manager interface guests use to find services.

use std::sync::{Arc, Weak};

use log::info;
use once_cell::sync::Lazy;
use types::result::sm;
use types::ResultCode;

use crate::context::RequestContext;
use crate::interface::{CommandTable, HandlerResult, SessionHandler};
use crate::manager::{decode_name, ServiceManager};

pub const NAME: &str = "sm:";

static COMMANDS: Lazy<CommandTable<UserInterface>> = Lazy::new(|| {
    CommandTable::new(NAME)
        .with(0, "Initialize", UserInterface::initialize)
        .with(1, "GetService", UserInterface::get_service)
        .with(2, "RegisterService", UserInterface::register_service)
        .with(3, "UnregisterService", UserInterface::unregister_service)
});

/// One client's `sm:` session.
pub struct UserInterface {
    // the registry owns this handler's factory
    manager: Weak<ServiceManager>,
    initialized: bool,
}

impl UserInterface {
    pub fn new(manager: Weak<ServiceManager>) -> Self {
        Self {
            manager,
            initialized: false,
        }
    }

    fn initialize(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        self.initialized = true;
        info!("sm: initialized by pid {}", ctx.pid);
        Ok(())
    }

    fn manager(&self) -> Result<Arc<ServiceManager>, ResultCode> {
        if !self.initialized {
            return Err(sm::INVALID_CLIENT);
        }
        self.manager.upgrade().ok_or(ResultCode::SESSION_CLOSED)
    }

    fn get_service(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let manager = self.manager()?;
        let name = decode_name(ctx.pop_u64()?)?;
        let session = manager.connect(&name, Some(ctx.pid))?;
        ctx.move_object(session);
        Ok(())
    }

    fn register_service(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let manager = self.manager()?;
        let name = decode_name(ctx.pop_u64()?)?;
        let _is_light = ctx.pop_bool()?;
        ctx.align_input(4);
        let max_sessions = ctx.pop_u32()?;
        let port = manager.register_guest(&name, max_sessions)?;
        ctx.move_object(port);
        Ok(())
    }

    fn unregister_service(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let manager = self.manager()?;
        let name = decode_name(ctx.pop_u64()?)?;
        manager.unregister(&name)
    }
}

impl SessionHandler for UserInterface {
    fn name(&self) -> &str {
        NAME
    }

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        COMMANDS.dispatch(self, ctx)
    }
}
