use types::{Handle, ResultCode};

use crate::arena::ObjectId;

#[derive(Debug, Clone, Copy)]
struct Entry {
    object: ObjectId,
    linear_id: u16,
}

/// Per-process map from handle values to kernel objects.
///
/// The table only stores ids; the kernel opens an object when a handle is
/// added and closes it when the handle is removed. Handle values combine the
/// slot index with a 15-bit linear id that advances on every insert, so a
/// freed slot never reproduces a value that is still in use.
#[derive(Debug)]
pub struct HandleTable {
    entries: Vec<Option<Entry>>,
    free: Vec<u16>,
    next_linear_id: u16,
    capacity: usize,
    count: usize,
}

const MAX_LINEAR_ID: u16 = 0x7FFF;

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            next_linear_id: 1,
            capacity: capacity.min(1 << Handle::INDEX_BITS),
            count: 0,
        }
    }

    fn allocate_linear_id(&mut self) -> u16 {
        let id = self.next_linear_id;
        self.next_linear_id = if id >= MAX_LINEAR_ID { 1 } else { id + 1 };
        id
    }

    pub fn add(&mut self, object: ObjectId) -> Result<Handle, ResultCode> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.entries.len() < self.capacity => {
                self.entries.push(None);
                (self.entries.len() - 1) as u16
            }
            None => return Err(ResultCode::OUT_OF_HANDLES),
        };
        let linear_id = self.allocate_linear_id();
        self.entries[index as usize] = Some(Entry { object, linear_id });
        self.count += 1;
        Ok(Handle::from_parts(index, linear_id))
    }

    fn entry(&self, handle: Handle) -> Option<&Entry> {
        if handle.reserved() != 0 || handle.linear_id() == 0 {
            return None;
        }
        self.entries
            .get(handle.index() as usize)?
            .as_ref()
            .filter(|e| e.linear_id == handle.linear_id())
    }

    /// Object referenced by a real (non-pseudo) handle.
    pub fn get(&self, handle: Handle) -> Option<ObjectId> {
        self.entry(handle).map(|e| e.object)
    }

    /// Removes the handle and returns the object it referenced; the caller
    /// closes that reference.
    pub fn remove(&mut self, handle: Handle) -> Result<ObjectId, ResultCode> {
        let object = self.get(handle).ok_or(ResultCode::INVALID_HANDLE)?;
        self.entries[handle.index() as usize] = None;
        self.free.push(handle.index());
        self.count -= 1;
        Ok(object)
    }

    /// First handle that refers to `object`.
    pub fn find(&self, object: ObjectId) -> Option<Handle> {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            Some(e) if e.object == object => Some(Handle::from_parts(i as u16, e.linear_id)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empties the table, returning every referenced object once per handle.
    pub fn drain(&mut self) -> Vec<ObjectId> {
        let objects = self.entries.iter().flatten().map(|e| e.object).collect();
        self.entries.clear();
        self.free.clear();
        self.count = 0;
        objects
    }
}
