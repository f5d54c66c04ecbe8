//! `fatal:u`: applications report unrecoverable errors here.

use log::error;
use once_cell::sync::Lazy;
use types::ResultCode;

use crate::context::RequestContext;
use crate::interface::{CommandTable, HandlerResult, SessionHandler};

pub const NAME: &str = "fatal:u";

static COMMANDS: Lazy<CommandTable<FatalService>> = Lazy::new(|| {
    CommandTable::new(NAME)
        .with(0, "ThrowFatal", FatalService::throw_fatal)
        .with(1, "ThrowFatalWithPolicy", FatalService::throw_fatal_with_policy)
        .with(2, "ThrowFatalWithCpuContext", FatalService::throw_fatal_with_cpu_context)
});

#[derive(Debug, Default)]
pub struct FatalService;

impl FatalService {
    fn report(&self, ctx: &RequestContext<'_>, rc: ResultCode, policy: u32) -> HandlerResult {
        error!(
            "pid {} thread {} threw fatal {} (policy {})",
            ctx.pid, ctx.tid, rc, policy
        );
        ctx.kernel().report_service_fatal(ctx.pid, ctx.tid, rc)
    }

    fn throw_fatal(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let rc = ResultCode::from_raw(ctx.pop_u32()?);
        self.report(ctx, rc, 0)
    }

    fn throw_fatal_with_policy(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let rc = ResultCode::from_raw(ctx.pop_u32()?);
        let policy = ctx.pop_u32()?;
        self.report(ctx, rc, policy)
    }

    fn throw_fatal_with_cpu_context(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let rc = ResultCode::from_raw(ctx.pop_u32()?);
        let policy = ctx.pop_u32()?;
        // the context buffer is informational only
        let context = ctx.read_buffer(0).unwrap_or_default();
        error!("fatal cpu context: {} bytes", context.len());
        self.report(ctx, rc, policy)
    }
}

impl SessionHandler for FatalService {
    fn name(&self) -> &str {
        NAME
    }

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        COMMANDS.dispatch(self, ctx)
    }
}
