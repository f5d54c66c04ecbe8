//! The service thread: drains HLE traffic from the kernel and answers it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kernel::{CommandType, HipcMessage, HleEvent, HleReply, HleRequest, Kernel, SessionKey};
use log::{debug, error, trace, warn};
use types::result::cmif;
use types::ResultCode;

use crate::cmif::{encode_response, CmifRequest};
use crate::context::{ReplyParts, RequestContext};
use crate::interface::{HandlerResult, SessionHandler};
use crate::manager::ServiceManager;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Size reported for the receive-side pointer buffer.
pub const POINTER_BUFFER_SIZE: u16 = 0x8000;

mod control {
    pub const CONVERT_CURRENT_OBJECT_TO_DOMAIN: u32 = 0;
    pub const CLONE_CURRENT_OBJECT: u32 = 2;
    pub const QUERY_POINTER_BUFFER_SIZE: u32 = 3;
    pub const CLONE_CURRENT_OBJECT_EX: u32 = 4;
}

type SharedHandler = Arc<Mutex<Box<dyn SessionHandler>>>;

/// Maps HLE sessions to their handlers and runs requests against them.
pub struct ServiceDispatcher {
    kernel: Kernel,
    manager: Arc<ServiceManager>,
    sessions: HashMap<SessionKey, SharedHandler>,
}

fn error_reply(rc: ResultCode) -> HleReply {
    HleReply {
        message: encode_response(rc, &[], 0, 0).unwrap_or_default(),
        ..Default::default()
    }
}

impl ServiceDispatcher {
    pub fn new(kernel: Kernel, manager: Arc<ServiceManager>) -> Self {
        Self {
            kernel,
            manager,
            sessions: HashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Serves requests until the kernel shuts down.
    pub fn run(mut self) {
        debug!("service thread started");
        while !self.kernel.is_shut_down() {
            self.poll(POLL_INTERVAL);
        }
        self.sessions.clear();
        debug!("service thread stopped");
    }

    /// Handles at most one event. Returns false when none arrived.
    pub fn poll(&mut self, timeout: Duration) -> bool {
        match self.kernel.next_hle_event(timeout) {
            Some(HleEvent::Request(request)) => {
                let id = request.id;
                let reply = self.process(request);
                if let Err(rc) = self.kernel.reply_hle(id, reply) {
                    debug!("reply to request {} dropped: {}", id, rc);
                }
                true
            }
            Some(HleEvent::SessionClosed(session)) => {
                trace!("{:?} closed by client", session);
                self.sessions.remove(&session);
                true
            }
            None => false,
        }
    }

    fn handler(&mut self, request: &HleRequest) -> Option<SharedHandler> {
        if let Some(handler) = self.sessions.get(&request.session) {
            return Some(handler.clone());
        }
        let port = request.port.as_deref()?;
        let handler = Arc::new(Mutex::new(self.manager.handler_for(port)?));
        self.sessions.insert(request.session, handler.clone());
        Some(handler)
    }

    fn process(&mut self, mut request: HleRequest) -> HleReply {
        let Some(handler) = self.handler(&request) else {
            warn!("request on {:?} with no service behind it", request.session);
            let mut reply = error_reply(ResultCode::SESSION_CLOSED);
            reply.close_session = true;
            return reply;
        };
        let msg = match HipcMessage::parse(&request.message) {
            Ok(msg) => msg,
            Err(rc) => {
                warn!("malformed message from pid {}: {}", request.pid, rc);
                return error_reply(cmif::INVALID_HEADER);
            }
        };
        match msg.command_type() {
            Some(CommandType::Close) => {
                self.sessions.remove(&request.session);
                HleReply {
                    message: HipcMessage::default().encode().unwrap_or_default(),
                    close_session: true,
                    ..Default::default()
                }
            }
            Some(CommandType::Request | CommandType::RequestWithContext) => {
                let cmif = match CmifRequest::parse(&msg) {
                    Ok(cmif) => cmif,
                    Err(rc) => return error_reply(rc),
                };
                let mut ctx = RequestContext::new(
                    &self.kernel,
                    request.pid,
                    request.tid,
                    cmif.command_id,
                    &msg,
                    &cmif.payload,
                );
                ctx.copy_objects = std::mem::take(&mut request.copy_objects);
                ctx.move_objects = std::mem::take(&mut request.move_objects);
                let result = handler
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle_request(&mut ctx);
                let parts = ctx.into_parts();
                self.build_reply(result, parts)
            }
            Some(CommandType::Control | CommandType::ControlWithContext) => {
                match CmifRequest::parse(&msg) {
                    Ok(cmif) => self.control(&handler, cmif.command_id),
                    Err(rc) => error_reply(rc),
                }
            }
            other => {
                error!("unsupported message type {:?} from pid {}", other, request.pid);
                error_reply(cmif::INVALID_HEADER)
            }
        }
    }

    fn control(&mut self, handler: &SharedHandler, command_id: u32) -> HleReply {
        match command_id {
            control::QUERY_POINTER_BUFFER_SIZE => {
                let mut payload = POINTER_BUFFER_SIZE.to_le_bytes().to_vec();
                payload.resize(4, 0);
                self.build_reply(Ok(()), ReplyParts::with_payload(payload))
            }
            control::CLONE_CURRENT_OBJECT | control::CLONE_CURRENT_OBJECT_EX => {
                let (key, client) = self.kernel.create_hle_session();
                self.sessions.insert(key, handler.clone());
                let mut parts = ReplyParts::with_payload(Vec::new());
                parts.moves.push(client);
                self.build_reply(Ok(()), parts)
            }
            control::CONVERT_CURRENT_OBJECT_TO_DOMAIN => {
                warn!("domains are not supported");
                error_reply(cmif::UNKNOWN_COMMAND_ID)
            }
            id => {
                warn!("unknown control command {}", id);
                error_reply(cmif::UNKNOWN_COMMAND_ID)
            }
        }
    }

    /// Opens sessions for returned interfaces and encodes the response.
    fn build_reply(&mut self, result: HandlerResult, parts: ReplyParts) -> HleReply {
        let rc = match result {
            Ok(()) => ResultCode::SUCCESS,
            Err(rc) => return error_reply(rc),
        };
        let ReplyParts {
            payload,
            copies,
            mut moves,
            interfaces,
        } = parts;
        for handler in interfaces {
            let (key, client) = self.kernel.create_hle_session();
            trace!("new {} session {:?}", handler.name(), key);
            self.sessions.insert(key, Arc::new(Mutex::new(handler)));
            moves.push(client);
        }
        match encode_response(rc, &payload, copies.len(), moves.len()) {
            Ok(message) => HleReply {
                message,
                copy_objects: copies,
                move_objects: moves,
                close_session: false,
            },
            Err(rc) => {
                error!("reply does not fit the message buffer: {}", rc);
                error_reply(rc)
            }
        }
    }
}

/// Starts the service thread.
pub fn spawn(kernel: Kernel, manager: Arc<ServiceManager>) -> io::Result<JoinHandle<()>> {
    let dispatcher = ServiceDispatcher::new(kernel, manager);
    thread::Builder::new()
        .name("services".to_string())
        .spawn(move || dispatcher.run())
}
