//! Boundary between the kernel and host-implemented services.
//!
//! Sessions whose server end is marked HLE never reach a guest thread:
//! SendSyncRequest turns into an [`HleEvent::Request`] picked up by the
//! service thread, which answers with [`Kernel::reply_hle`](crate::Kernel::reply_hle).

use std::fmt;
use std::sync::Arc;

use crate::arena::ObjectId;
use crate::kernel::KernelInner;

/// Identifies the server end of an HLE session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey(pub u64);

impl SessionKey {
    pub(crate) fn from_id(id: ObjectId) -> Self {
        SessionKey(id.to_raw())
    }

    pub(crate) fn id(self) -> ObjectId {
        ObjectId::from_raw(self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:?})", self.id())
    }
}

/// Owned reference to a kernel object held by host code. Dropping it
/// closes the reference.
pub struct ObjectRef {
    kernel: Arc<KernelInner>,
    id: ObjectId,
}

impl ObjectRef {
    /// Wraps an id whose reference the caller already owns.
    pub(crate) fn adopt(kernel: Arc<KernelInner>, id: ObjectId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Gives up ownership without closing; the caller now owns the reference.
    pub(crate) fn into_id(self) -> ObjectId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        self.kernel.lock().objects.open(self.id);
        Self {
            kernel: self.kernel.clone(),
            id: self.id,
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        self.kernel.lock().close_object(self.id);
        self.kernel.notify();
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:?})", self.id)
    }
}

/// Queued inside the kernel; carries raw references until handed out.
#[derive(Debug)]
pub(crate) enum HleItem {
    Request {
        id: u64,
        session: ObjectId,
        port: Option<String>,
        pid: u64,
        tid: u64,
        message: Vec<u8>,
        copies: Vec<ObjectId>,
        moves: Vec<ObjectId>,
    },
    SessionClosed(ObjectId),
}

#[derive(Debug)]
pub struct HleRequest {
    pub id: u64,
    pub session: SessionKey,
    /// Port the session was opened through, `None` for sessions created by
    /// a service.
    pub port: Option<String>,
    pub pid: u64,
    pub tid: u64,
    /// Raw message buffer, pid field already filled in by the kernel.
    pub message: Vec<u8>,
    pub copy_objects: Vec<ObjectRef>,
    pub move_objects: Vec<ObjectRef>,
}

#[derive(Debug)]
pub enum HleEvent {
    Request(HleRequest),
    SessionClosed(SessionKey),
}

/// Answer to an [`HleRequest`]. Handle slots in `message` are placeholders;
/// the kernel fills them with handles in the client process for
/// `copy_objects` then `move_objects`, in descriptor order.
#[derive(Debug, Default)]
pub struct HleReply {
    pub message: Vec<u8>,
    pub copy_objects: Vec<ObjectRef>,
    pub move_objects: Vec<ObjectRef>,
    /// Close the server end after delivering the reply.
    pub close_session: bool,
}
