use std::collections::BTreeMap;

use log::{debug, warn};
use types::result::cmif;
use types::ResultCode;

use crate::context::RequestContext;

pub type HandlerResult = Result<(), ResultCode>;

/// Handler for one command of interface `S`.
pub type Handler<S> = fn(&mut S, &mut RequestContext<'_>) -> HandlerResult;

/// Object behind an HLE session.
pub trait SessionHandler: Send {
    fn name(&self) -> &str;

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult;
}

/// Command id to handler table of one interface.
///
/// Tables are built once per interface type and shared by every session
/// of that type.
pub struct CommandTable<S> {
    name: &'static str,
    commands: BTreeMap<u32, (&'static str, Handler<S>)>,
}

impl<S> CommandTable<S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            commands: BTreeMap::new(),
        }
    }

    pub fn with(mut self, id: u32, name: &'static str, handler: Handler<S>) -> Self {
        self.commands.insert(id, (name, handler));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn command_name(&self, id: u32) -> Option<&'static str> {
        self.commands.get(&id).map(|(name, _)| *name)
    }

    pub fn dispatch(&self, service: &mut S, ctx: &mut RequestContext<'_>) -> HandlerResult {
        match self.commands.get(&ctx.command_id) {
            Some((name, handler)) => {
                debug!("{}::{} (pid {})", self.name, name, ctx.pid);
                handler(service, ctx)
            }
            None => {
                warn!(
                    "{}: unimplemented command {} (pid {}), raw {}",
                    self.name,
                    ctx.command_id,
                    ctx.pid,
                    hex::encode(&ctx.message().raw)
                );
                Err(cmif::UNKNOWN_COMMAND_ID)
            }
        }
    }
}
