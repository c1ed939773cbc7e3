//! Handle tables
//!
//! A handle is a process-local name for a kernel object. Holding a handle is
//! the only way to reach an object: object ids are never accepted as
//! authority. Ids are unique within a table and the lowest free id is
//! reused after close.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::object::{KernelObject, ObjectType, TypedObject};
use crate::types::HandleId;

/// Handle lookup and insertion errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleError {
    /// No such handle in this table
    NotFound(HandleId),
    /// Handle refers to an object of another type
    WrongType {
        handle: HandleId,
        expected: ObjectType,
        actual: ObjectType,
    },
    /// Table at capacity
    TableFull,
}

/// One process's handles
#[derive(Clone)]
pub struct HandleTable {
    handles: BTreeMap<HandleId, Arc<dyn KernelObject>>,
    capacity: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ids(&self) -> impl Iterator<Item = HandleId> + '_ {
        self.handles.keys().copied()
    }

    /// Install `object` under the lowest free id (ids start at 1).
    pub fn insert(&mut self, object: Arc<dyn KernelObject>) -> Result<HandleId, HandleError> {
        if self.handles.len() >= self.capacity {
            return Err(HandleError::TableFull);
        }
        let mut candidate = 1u32;
        for id in self.handles.keys() {
            if id.0 != candidate {
                break;
            }
            candidate += 1;
        }
        let id = HandleId(candidate);
        self.handles.insert(id, object);
        Ok(id)
    }

    pub fn get(&self, id: HandleId) -> Result<Arc<dyn KernelObject>, HandleError> {
        self.handles
            .get(&id)
            .cloned()
            .ok_or(HandleError::NotFound(id))
    }

    /// Look up a handle and check the object's concrete type.
    pub fn get_typed<T: TypedObject>(&self, id: HandleId) -> Result<Arc<T>, HandleError> {
        let object = self.get(id)?;
        let actual = object.object_type();
        object
            .into_any()
            .downcast::<T>()
            .map_err(|_| HandleError::WrongType {
                handle: id,
                expected: T::TYPE,
                actual,
            })
    }

    /// Remove a handle, returning its object so the caller can drop it
    /// outside any lock.
    pub fn close(&mut self, id: HandleId) -> Result<Arc<dyn KernelObject>, HandleError> {
        self.handles.remove(&id).ok_or(HandleError::NotFound(id))
    }

    /// A second handle to the same object in this table.
    pub fn duplicate(&mut self, id: HandleId) -> Result<HandleId, HandleError> {
        let object = self.get(id)?;
        self.insert(object)
    }

    /// A handle to the same object in `other`.
    pub fn duplicate_into(
        &self,
        id: HandleId,
        other: &mut HandleTable,
    ) -> Result<HandleId, HandleError> {
        let object = self.get(id)?;
        other.insert(object)
    }

    /// Same ids, same objects: the table a forked child starts with.
    pub fn clone_for_fork(&self) -> HandleTable {
        self.clone()
    }

    /// Close everything, returning the objects for dropping outside locks.
    pub fn clear(&mut self) -> Vec<Arc<dyn KernelObject>> {
        core::mem::take(&mut self.handles).into_values().collect()
    }
}
