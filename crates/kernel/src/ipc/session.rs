use std::collections::VecDeque;

use crate::arena::ObjectId;
use crate::sync::WaitQueue;

/// A SendSyncRequest waiting to be received or answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: u64,
    pub thread: ObjectId,
    pub pid: u64,
    /// The sender died after the server received the request; the reply is
    /// dropped.
    pub client_gone: bool,
}

/// Server end of a session. At most one request is being handled at a
/// time; later ones queue behind it in arrival order.
#[derive(Debug)]
pub struct ServerSession {
    pub client: ObjectId,
    /// Port the session was opened through; HLE services use it to pick the
    /// interface for a new session.
    pub port_name: Option<String>,
    pub hle: bool,
    /// The HLE side still holds its reference.
    pub hle_open: bool,
    pub queue: VecDeque<PendingRequest>,
    pub current: Option<PendingRequest>,
    pub waiters: WaitQueue,
    pub client_closed: bool,
}

impl ServerSession {
    pub fn new(client: ObjectId, port_name: Option<String>, hle: bool) -> Self {
        Self {
            client,
            port_name,
            hle,
            hle_open: hle,
            queue: VecDeque::new(),
            current: None,
            waiters: WaitQueue::new(),
            client_closed: false,
        }
    }

    /// Readable by ReplyAndReceive: a request is waiting, or the client end
    /// is gone.
    pub fn is_signaled(&self) -> bool {
        (self.current.is_none() && !self.queue.is_empty()) || self.client_closed
    }

    /// Removes a request by id from wherever it is; a request already being
    /// handled is only marked.
    pub fn abandon(&mut self, request: u64) {
        if let Some(current) = self.current.as_mut().filter(|r| r.id == request) {
            current.client_gone = true;
            return;
        }
        self.queue.retain(|r| r.id != request);
    }
}

#[derive(Debug)]
pub struct ClientSession {
    pub server: ObjectId,
    pub server_closed: bool,
    /// Client port whose session count this session occupies.
    pub port: Option<ObjectId>,
    /// Resource limit charged for the session.
    pub limit: Option<ObjectId>,
}
