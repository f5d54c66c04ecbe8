use crate::arena::ObjectId;
use crate::sync::WaitQueue;

/// Waitable half of an event pair.
#[derive(Debug, Default)]
pub struct ReadableEvent {
    pub signaled: bool,
    pub waiters: WaitQueue,
}

/// Signalling half; holds a reference on its readable event and on the
/// resource limit charged for the pair.
#[derive(Debug)]
pub struct WritableEvent {
    pub readable: ObjectId,
    pub limit: Option<ObjectId>,
}
