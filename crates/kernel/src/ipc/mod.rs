//! Kernel side of synchronous IPC: ports, sessions and the copy of a
//! message from one thread's TLS to another's.
//!
//! Handles named in a message's handle descriptor are translated on the
//! way: copy handles are duplicated into the receiving process, move
//! handles leave the sender's table. Buffer descriptors are passed through
//! untouched.

pub mod message;
pub mod port;
pub mod session;

use std::collections::VecDeque;

use log::{debug, trace};
use types::{Handle, ResultCode};

use crate::arena::ObjectId;
use crate::hle::HleItem;
use crate::object::KObject;
use crate::resource_limit::LimitableResource;
use crate::state::KernelState;
use crate::thread::{ThreadState, WaitKind};

use message::{patch_u32, patch_u64, HipcMessage, MESSAGE_BUFFER_SIZE};
use port::{ClientPort, PortBackend, ServerPort};
use session::{ClientSession, PendingRequest, ServerSession};

/// A message lifted out of a sender's TLS together with the references
/// its handle descriptor carries.
#[derive(Debug)]
pub(crate) struct OutgoingMessage {
    pub buffer: Vec<u8>,
    pub copies: Vec<ObjectId>,
    pub moves: Vec<ObjectId>,
}

const PLACEHOLDER: u64 = u64::MAX;

impl KernelState {
    pub(crate) fn create_hle_port(&mut self, name: Option<String>, max_sessions: u32) -> ObjectId {
        self.objects.insert(KObject::ClientPort(ClientPort::new(
            name,
            PortBackend::Hle,
            max_sessions,
        )))
    }

    /// Creates a guest port; returns (server, client), each with its
    /// creation reference.
    pub(crate) fn create_guest_port(&mut self, name: Option<String>, max_sessions: u32) -> (ObjectId, ObjectId) {
        let server = self.objects.insert(KObject::ServerPort(ServerPort {
            name: name.clone(),
            ..Default::default()
        }));
        let client = self.objects.insert(KObject::ClientPort(ClientPort::new(
            name,
            PortBackend::Guest(server),
            max_sessions,
        )));
        if let Some(s) = self.objects.server_port_mut(server) {
            s.client = Some(client);
        }
        (server, client)
    }

    pub(crate) fn register_named_port(&mut self, name: &str, client_port: ObjectId) -> Result<(), ResultCode> {
        if self.named_ports.contains_key(name) {
            return Err(ResultCode::INVALID_STATE);
        }
        if self.objects.client_port(client_port).is_none() || !self.objects.open(client_port) {
            return Err(ResultCode::INVALID_HANDLE);
        }
        self.named_ports.insert(name.to_string(), client_port);
        Ok(())
    }

    pub(crate) fn unregister_named_port(&mut self, name: &str) -> Result<(), ResultCode> {
        let port = self.named_ports.remove(name).ok_or(ResultCode::NOT_FOUND)?;
        self.close_object(port);
        Ok(())
    }

    /// Creates both ends of a session; each comes with its creation
    /// reference.
    pub(crate) fn create_session_pair(
        &mut self,
        port_name: Option<String>,
        hle: bool,
        port: Option<ObjectId>,
        limit: Option<ObjectId>,
    ) -> (ObjectId, ObjectId) {
        let server = self.objects.insert(KObject::ServerSession(ServerSession::new(
            ObjectId::from_raw(PLACEHOLDER),
            port_name,
            hle,
        )));
        let client = self.objects.insert(KObject::ClientSession(ClientSession {
            server,
            server_closed: false,
            port,
            limit,
        }));
        if let Some(s) = self.objects.server_session_mut(server) {
            s.client = client;
        }
        (server, client)
    }

    /// Charges one session to `process`'s resource limit and returns the
    /// limit with a reference held for the session.
    pub(crate) fn reserve_session(&mut self, process: Option<ObjectId>) -> Result<Option<ObjectId>, ResultCode> {
        let Some(limit) = process.and_then(|p| self.objects.process(p)).map(|p| p.resource_limit) else {
            return Ok(None);
        };
        let reserved = self
            .objects
            .resource_limit_mut(limit)
            .map_or(false, |l| l.reserve(LimitableResource::Sessions, 1));
        if !reserved {
            return Err(ResultCode::LIMIT_REACHED);
        }
        self.objects.open(limit);
        Ok(Some(limit))
    }

    /// Opens a session through a client port. For guest ports the server
    /// end is queued on the server port until accepted.
    pub(crate) fn connect(&mut self, client_port: ObjectId, caller: Option<ObjectId>) -> Result<ObjectId, ResultCode> {
        let port = self
            .objects
            .client_port(client_port)
            .ok_or(ResultCode::INVALID_HANDLE)?;
        if port.closed {
            return Err(ResultCode::PORT_CLOSED);
        }
        if port.sessions >= port.max_sessions {
            return Err(ResultCode::OUT_OF_SESSIONS);
        }
        let (name, backend) = (port.name.clone(), port.backend);
        if let PortBackend::Guest(server_port) = backend {
            if self.objects.server_port(server_port).is_none() {
                return Err(ResultCode::PORT_CLOSED);
            }
        }
        let limit = self.reserve_session(caller)?;

        let hle = backend == PortBackend::Hle;
        let (server, client) = self.create_session_pair(name.clone(), hle, Some(client_port), limit);
        if let Some(p) = self.objects.client_port_mut(client_port) {
            p.sessions += 1;
        }
        if let PortBackend::Guest(server_port) = backend {
            if let Some(p) = self.objects.server_port_mut(server_port) {
                p.pending.push_back(server);
            }
            self.signal_object(server_port);
        }
        debug!("connected session {:?} to port {:?}", client, name);
        Ok(client)
    }

    /// Reads `thread`'s message buffer and takes the references its handle
    /// descriptor names. The pid field is overwritten with the sender's pid.
    pub(crate) fn take_outgoing(&mut self, thread: ObjectId) -> Result<OutgoingMessage, ResultCode> {
        let t = self.objects.thread(thread).ok_or(ResultCode::INVALID_HANDLE)?;
        let (pid, tls) = (t.pid, t.tls);
        let process = self.process_of(thread)?;
        let mut buffer = self.read_guest(process, tls, MESSAGE_BUFFER_SIZE)?;
        let msg = HipcMessage::parse(&buffer)?;
        if let Some(offset) = msg.pid_offset {
            patch_u64(&mut buffer, offset, pid);
        }

        let mut out = OutgoingMessage {
            buffer,
            copies: Vec::new(),
            moves: Vec::new(),
        };
        for &raw in &msg.copy_handles {
            match self.resolve(thread, Handle(raw)) {
                Ok(id) => {
                    self.objects.open(id);
                    out.copies.push(id);
                }
                Err(rc) => {
                    self.drop_message(out);
                    return Err(rc);
                }
            }
        }
        for &raw in &msg.move_handles {
            let removed = match self.objects.process_mut(process) {
                Some(p) => p.handles.remove(Handle(raw)),
                None => Err(ResultCode::INVALID_HANDLE),
            };
            match removed {
                Ok(id) => out.moves.push(id),
                Err(rc) => {
                    self.drop_message(out);
                    return Err(rc);
                }
            }
        }
        Ok(out)
    }

    /// Installs the message's references as handles of `process`, writing
    /// the new values into the handle slots. On failure nothing stays
    /// installed and every reference is released.
    pub(crate) fn install_incoming(
        &mut self,
        process: ObjectId,
        out: &mut OutgoingMessage,
    ) -> Result<Vec<Handle>, ResultCode> {
        let msg = HipcMessage::parse(&out.buffer)?;
        let objects: Vec<ObjectId> = out.copies.drain(..).chain(out.moves.drain(..)).collect();
        if msg.copy_handles.len() + msg.move_handles.len() != objects.len() {
            for object in objects {
                self.close_object(object);
            }
            return Err(ResultCode::INVALID_COMBINATION);
        }
        let mut offset = msg.handles_offset;
        let mut installed = Vec::with_capacity(objects.len());
        let mut remaining = objects.into_iter();
        while let Some(object) = remaining.next() {
            match self.add_new_handle(process, object) {
                Ok(handle) => {
                    patch_u32(&mut out.buffer, offset, handle.raw());
                    installed.push(handle);
                }
                Err(rc) => {
                    for object in remaining {
                        self.close_object(object);
                    }
                    self.uninstall(process, installed);
                    return Err(rc);
                }
            }
            offset += 4;
        }
        Ok(installed)
    }

    fn uninstall(&mut self, process: ObjectId, handles: Vec<Handle>) {
        for handle in handles {
            if let Err(rc) = self.close_handle(process, handle) {
                debug!("undoing delivered handle {:?}: {}", handle, rc);
            }
        }
    }

    /// Installs `out` into the process of `thread` and writes it to that
    /// thread's message buffer.
    fn deliver_to(&mut self, thread: ObjectId, mut out: OutgoingMessage) -> Result<(), ResultCode> {
        let process = match self.process_of(thread) {
            Ok(process) => process,
            Err(rc) => {
                self.drop_message(out);
                return Err(rc);
            }
        };
        let tls = self.objects.thread(thread).map_or(0, |t| t.tls);
        let installed = self.install_incoming(process, &mut out)?;
        if let Err(rc) = self.write_guest(process, tls, &out.buffer) {
            self.uninstall(process, installed);
            return Err(rc);
        }
        Ok(())
    }

    pub(crate) fn drop_message(&mut self, out: OutgoingMessage) {
        for object in out.copies.into_iter().chain(out.moves) {
            self.close_object(object);
        }
    }

    fn awaits_reply(&self, request: &PendingRequest) -> bool {
        self.objects.thread(request.thread).map_or(false, |t| {
            t.state == ThreadState::Waiting
                && matches!(t.wait, Some(WaitKind::IpcReply { request: id, .. }) if id == request.id)
        })
    }

    fn fail_request(&mut self, request: &PendingRequest, rc: ResultCode) {
        if !request.client_gone && self.awaits_reply(request) {
            self.end_wait(request.thread, rc, &[]);
        }
    }

    /// SendSyncRequest: queues the caller's message on the session and
    /// blocks the caller until the reply.
    pub(crate) fn send_request(&mut self, thread: ObjectId, client_session: ObjectId) -> Result<(), ResultCode> {
        let c = self
            .objects
            .client_session(client_session)
            .ok_or(ResultCode::INVALID_HANDLE)?;
        if c.server_closed {
            return Err(ResultCode::SESSION_CLOSED);
        }
        let server = c.server;
        let pid = self.objects.thread(thread).map_or(0, |t| t.pid);
        let id = self.request_id();
        let s = self
            .objects
            .server_session_mut(server)
            .ok_or(ResultCode::SESSION_CLOSED)?;
        s.queue.push_back(PendingRequest {
            id,
            thread,
            pid,
            client_gone: false,
        });
        let hle = s.hle;
        trace!("request {} from pid {} on {:?}", id, pid, server);
        self.begin_wait(thread, WaitKind::IpcReply { session: server, request: id }, -1);
        if hle {
            self.dispatch_hle(server);
        } else {
            self.signal_object(server);
        }
        Ok(())
    }

    /// Hands the next queued request of an HLE session to the service
    /// thread, unless one is already in flight.
    pub(crate) fn dispatch_hle(&mut self, server: ObjectId) {
        loop {
            let Some(s) = self.objects.server_session_mut(server) else {
                return;
            };
            if s.current.is_some() {
                return;
            }
            let Some(request) = s.queue.pop_front() else {
                return;
            };
            s.current = Some(request.clone());
            let port = s.port_name.clone();
            match self.take_outgoing(request.thread) {
                Ok(out) => {
                    let tid = self.objects.thread(request.thread).map_or(0, |t| t.tid);
                    trace!(
                        "hle request {} on {:?}: {}",
                        request.id,
                        port,
                        hex::encode(&out.buffer[..out.buffer.len().min(0x40)])
                    );
                    self.hle_requests.insert(request.id, server);
                    self.hle_queue.push_back(HleItem::Request {
                        id: request.id,
                        session: server,
                        port,
                        pid: request.pid,
                        tid,
                        message: out.buffer,
                        copies: out.copies,
                        moves: out.moves,
                    });
                    return;
                }
                Err(rc) => {
                    debug!("request {} rejected before dispatch: {}", request.id, rc);
                    if let Some(s) = self.objects.server_session_mut(server) {
                        s.current = None;
                    }
                    self.fail_request(&request, rc);
                }
            }
        }
    }

    /// Moves the next request of a guest session into the receiving
    /// thread's TLS.
    pub(crate) fn receive_request(&mut self, thread: ObjectId, session: ObjectId) -> Result<(), ResultCode> {
        let s = self
            .objects
            .server_session_mut(session)
            .ok_or(ResultCode::INVALID_HANDLE)?;
        if s.current.is_some() {
            return Err(ResultCode::INVALID_STATE);
        }
        let Some(request) = s.queue.pop_front() else {
            return Err(if s.client_closed {
                ResultCode::SESSION_CLOSED
            } else {
                ResultCode::NOT_FOUND
            });
        };
        s.current = Some(request.clone());

        let result = self
            .take_outgoing(request.thread)
            .and_then(|out| self.deliver_to(thread, out));
        if let Err(rc) = result {
            if let Some(s) = self.objects.server_session_mut(session) {
                s.current = None;
            }
            self.fail_request(&request, rc);
            return Err(rc);
        }
        Ok(())
    }

    /// Writes a reply into the client's TLS and wakes it. A client that
    /// went away gets nothing; its references are dropped.
    fn deliver_reply(&mut self, request: PendingRequest, out: OutgoingMessage) {
        if request.client_gone || !self.awaits_reply(&request) {
            self.drop_message(out);
            return;
        }
        let rc = self
            .deliver_to(request.thread, out)
            .err()
            .unwrap_or(ResultCode::SUCCESS);
        self.end_wait(request.thread, rc, &[]);
    }

    /// Reply half of ReplyAndReceive.
    pub(crate) fn reply_from_guest(&mut self, thread: ObjectId, session: ObjectId) -> Result<(), ResultCode> {
        let request = self
            .objects
            .server_session_mut(session)
            .ok_or(ResultCode::INVALID_HANDLE)?
            .current
            .take()
            .ok_or(ResultCode::INVALID_STATE)?;
        match self.take_outgoing(thread) {
            Ok(out) => self.deliver_reply(request, out),
            Err(rc) => {
                self.fail_request(&request, rc);
                return Err(rc);
            }
        }
        self.signal_object(session);
        Ok(())
    }

    /// Delivers an HLE service's answer to request `id`.
    pub(crate) fn reply_hle(&mut self, id: u64, out: OutgoingMessage, close: bool) -> Result<(), ResultCode> {
        let Some(session) = self.hle_requests.remove(&id) else {
            self.drop_message(out);
            return Err(ResultCode::NOT_FOUND);
        };
        let request = match self.objects.server_session_mut(session) {
            Some(s) if s.current.as_ref().map(|r| r.id) == Some(id) => s.current.take(),
            _ => None,
        };
        let Some(request) = request else {
            self.drop_message(out);
            return Err(ResultCode::NOT_FOUND);
        };
        self.deliver_reply(request, out);
        if close {
            self.release_hle_session(session);
        } else {
            self.dispatch_hle(session);
        }
        Ok(())
    }

    /// Drops the reference the HLE side holds on a server session.
    pub(crate) fn release_hle_session(&mut self, session: ObjectId) {
        let release = match self.objects.server_session_mut(session) {
            Some(s) if s.hle_open => {
                s.hle_open = false;
                true
            }
            _ => false,
        };
        if release {
            self.close_object(session);
        }
    }

    pub(crate) fn server_session_destroyed(&mut self, id: ObjectId, session: ServerSession) {
        if let Some(c) = self.objects.client_session_mut(session.client) {
            c.server_closed = true;
        }
        for request in session.current.iter().chain(session.queue.iter()) {
            self.fail_request(request, ResultCode::SESSION_CLOSED);
        }
        self.hle_requests.retain(|_, s| *s != id);

        let mut kept = VecDeque::new();
        let mut dropped = Vec::new();
        for item in self.hle_queue.drain(..) {
            match item {
                HleItem::Request { session, copies, moves, .. } if session == id => {
                    dropped.extend(copies);
                    dropped.extend(moves);
                }
                other => kept.push_back(other),
            }
        }
        self.hle_queue = kept;
        for object in dropped {
            self.close_object(object);
        }
    }

    pub(crate) fn client_session_destroyed(&mut self, session: ClientSession, pending: &mut Vec<ObjectId>) {
        if let Some(s) = self.objects.server_session_mut(session.server) {
            s.client_closed = true;
            if s.hle && s.hle_open {
                s.hle_open = false;
                self.hle_queue.push_back(HleItem::SessionClosed(session.server));
                pending.push(session.server);
            }
        }
        self.signal_object(session.server);
        if let Some(p) = session.port.and_then(|p| self.objects.client_port_mut(p)) {
            p.sessions = p.sessions.saturating_sub(1);
        }
        if let Some(limit) = session.limit {
            if let Some(l) = self.objects.resource_limit_mut(limit) {
                l.release(LimitableResource::Sessions, 1);
            }
            pending.push(limit);
        }
    }
}
