use std::fmt;

use crate::arena::{Arena, ObjectId};
use crate::event::{ReadableEvent, WritableEvent};
use crate::ipc::port::{ClientPort, ServerPort};
use crate::ipc::session::{ClientSession, ServerSession};
use crate::process::Process;
use crate::resource_limit::ResourceLimit;
use crate::shared_memory::SharedMemory;
use crate::thread::Thread;

#[derive(Debug)]
pub enum KObject {
    Process(Process),
    Thread(Thread),
    ReadableEvent(ReadableEvent),
    WritableEvent(WritableEvent),
    SharedMemory(SharedMemory),
    ResourceLimit(ResourceLimit),
    ServerPort(ServerPort),
    ClientPort(ClientPort),
    ServerSession(ServerSession),
    ClientSession(ClientSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Process,
    Thread,
    ReadableEvent,
    WritableEvent,
    SharedMemory,
    ResourceLimit,
    ServerPort,
    ClientPort,
    ServerSession,
    ClientSession,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl KObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            KObject::Process(_) => ObjectKind::Process,
            KObject::Thread(_) => ObjectKind::Thread,
            KObject::ReadableEvent(_) => ObjectKind::ReadableEvent,
            KObject::WritableEvent(_) => ObjectKind::WritableEvent,
            KObject::SharedMemory(_) => ObjectKind::SharedMemory,
            KObject::ResourceLimit(_) => ObjectKind::ResourceLimit,
            KObject::ServerPort(_) => ObjectKind::ServerPort,
            KObject::ClientPort(_) => ObjectKind::ClientPort,
            KObject::ServerSession(_) => ObjectKind::ServerSession,
            KObject::ClientSession(_) => ObjectKind::ClientSession,
        }
    }
}

#[derive(Debug)]
struct ObjectEntry {
    refs: u32,
    object: KObject,
}

/// Every live kernel object with its reference count.
///
/// Objects start with one reference owned by whoever created them. Handles,
/// waits in progress and back links each hold one more.
#[derive(Debug, Default)]
pub struct ObjectTable {
    arena: Arena<ObjectEntry>,
}

macro_rules! accessors {
    ($($variant:ident => $get:ident, $get_mut:ident;)*) => {
        impl ObjectTable {
            $(
                pub fn $get(&self, id: ObjectId) -> Option<&$variant> {
                    match self.arena.get(id).map(|e| &e.object) {
                        Some(KObject::$variant(object)) => Some(object),
                        _ => None,
                    }
                }

                pub fn $get_mut(&mut self, id: ObjectId) -> Option<&mut $variant> {
                    match self.arena.get_mut(id).map(|e| &mut e.object) {
                        Some(KObject::$variant(object)) => Some(object),
                        _ => None,
                    }
                }
            )*
        }
    };
}

accessors! {
    Process => process, process_mut;
    Thread => thread, thread_mut;
    ReadableEvent => readable_event, readable_event_mut;
    WritableEvent => writable_event, writable_event_mut;
    SharedMemory => shared_memory, shared_memory_mut;
    ResourceLimit => resource_limit, resource_limit_mut;
    ServerPort => server_port, server_port_mut;
    ClientPort => client_port, client_port_mut;
    ServerSession => server_session, server_session_mut;
    ClientSession => client_session, client_session_mut;
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: KObject) -> ObjectId {
        self.arena.insert(ObjectEntry { refs: 1, object })
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.arena.contains(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&KObject> {
        self.arena.get(id).map(|e| &e.object)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut KObject> {
        self.arena.get_mut(id).map(|e| &mut e.object)
    }

    pub fn kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.get(id).map(KObject::kind)
    }

    pub fn refs(&self, id: ObjectId) -> u32 {
        self.arena.get(id).map_or(0, |e| e.refs)
    }

    /// Adds a reference. Returns false for a dead id.
    pub fn open(&mut self, id: ObjectId) -> bool {
        match self.arena.get_mut(id) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drops a reference, handing the object back once the last one is
    /// gone so the caller can tear it down.
    pub fn release(&mut self, id: ObjectId) -> Option<KObject> {
        let entry = self.arena.get_mut(id)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }
        self.arena.remove(id).map(|e| e.object)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.arena
            .iter()
            .filter(|(_, e)| e.object.kind() == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_release_hands_back_the_object() {
        let mut table = ObjectTable::new();
        let id = table.insert(KObject::ReadableEvent(ReadableEvent::default()));
        assert!(table.open(id));
        assert!(table.release(id).is_none());
        assert!(table.readable_event(id).is_some());
        assert!(matches!(table.release(id), Some(KObject::ReadableEvent(_))));
        assert!(table.release(id).is_none());
        assert!(!table.open(id));
    }

    #[test]
    fn typed_accessors_check_the_variant() {
        let mut table = ObjectTable::new();
        let id = table.insert(KObject::ResourceLimit(ResourceLimit::default()));
        assert!(table.resource_limit(id).is_some());
        assert!(table.thread(id).is_none());
        assert_eq!(table.kind(id), Some(ObjectKind::ResourceLimit));
    }
}
