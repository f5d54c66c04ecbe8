use std::collections::VecDeque;

use crate::arena::ObjectId;
use crate::sync::WaitQueue;

/// Who answers sessions opened through a client port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortBackend {
    /// Requests are forwarded to the host service thread.
    Hle,
    /// A guest server accepts sessions from this server port.
    Guest(ObjectId),
}

/// Guest-side accept end of a port. Signaled while sessions wait to be
/// accepted; each queued server session holds one reference.
#[derive(Debug, Default)]
pub struct ServerPort {
    pub name: Option<String>,
    pub pending: VecDeque<ObjectId>,
    pub waiters: WaitQueue,
    pub client: Option<ObjectId>,
}

#[derive(Debug)]
pub struct ClientPort {
    pub name: Option<String>,
    pub backend: PortBackend,
    pub max_sessions: u32,
    pub sessions: u32,
    /// The server side went away; further connects fail.
    pub closed: bool,
}

impl ClientPort {
    pub fn new(name: Option<String>, backend: PortBackend, max_sessions: u32) -> Self {
        Self {
            name,
            backend,
            max_sessions,
            sessions: 0,
            closed: false,
        }
    }
}
