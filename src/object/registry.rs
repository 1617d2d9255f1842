use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use super::LogicalObjectId;
use crate::{VmError, VmResult};

/// Backing storage of an object. Kernels reach it through the read/write guards
/// handed out by their kernel context.
pub type ObjectBuffer = Arc<RwLock<Vec<u8>>>;

/// Point-in-time view of an object's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub id: LogicalObjectId,
    /// Unretired instructions that reference the object.
    pub ref_count: usize,
    /// Caller-owned holds.
    pub holds: usize,
    /// Submitted instructions naming the object that are not admitted yet.
    pub pending: usize,
    pub len: usize,
}

#[derive(Debug)]
struct Object {
    buffer: ObjectBuffer,
    ref_count: usize,
    holds: usize,
}

impl Object {
    fn new(bytes: Vec<u8>, holds: usize) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(bytes)),
            ref_count: 0,
            holds,
        }
    }

    fn is_unreferenced(&self) -> bool {
        self.ref_count == 0 && self.holds == 0
    }
}

/// Per-object count of submitted instructions the scheduler has not admitted
/// yet. Submitters update it without taking the scheduler lock.
#[derive(Debug, Default)]
pub struct PendingRefs {
    counts: Mutex<HashMap<LogicalObjectId, usize>>,
}

impl PendingRefs {
    /// Records one queued submission naming each of `objects`.
    pub(crate) fn add(&self, objects: &[LogicalObjectId]) {
        let mut counts = self.counts.lock();
        for object in objects {
            *counts.entry(*object).or_default() += 1;
        }
    }

    /// Drops the references [`add`](Self::add) recorded, once the submission
    /// is admitted or rejected.
    pub(crate) fn settle(&self, objects: &[LogicalObjectId]) {
        let mut counts = self.counts.lock();
        for object in objects {
            let Some(count) = counts.get_mut(object) else {
                lifecycle_violation!("settled object {object} without a pending submission");
            };
            *count -= 1;
            if *count == 0 {
                counts.remove(object);
            }
        }
    }

    pub fn count(&self, id: LogicalObjectId) -> usize {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }
}

/// Single-owner map from [`LogicalObjectId`] to its object.
///
/// Only the scheduler's serialized phase mutates the registry: counts go up at
/// admission and down at retirement. An object is destroyed once neither a
/// caller hold nor an instruction, admitted or still queued, references it.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<LogicalObjectId, Object>,
    pending: Arc<PendingRefs>,
    created: u64,
    destroyed: u64,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an object with one caller hold.
    pub fn create(&mut self, id: LogicalObjectId, bytes: Vec<u8>) -> VmResult<()> {
        if self.objects.contains_key(&id) {
            return Err(VmError::ObjectExists(id));
        }
        debug!(object = %id, len = bytes.len(), "object created");
        self.objects.insert(id, Object::new(bytes, 1));
        self.created += 1;
        Ok(())
    }

    pub fn contains(&self, id: LogicalObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn info(&self, id: LogicalObjectId) -> Option<ObjectInfo> {
        self.objects.get(&id).map(|object| ObjectInfo {
            id,
            ref_count: object.ref_count,
            holds: object.holds,
            pending: self.pending.count(id),
            len: object.buffer.read().len(),
        })
    }

    pub fn buffer(&self, id: LogicalObjectId) -> Option<ObjectBuffer> {
        self.objects.get(&id).map(|object| object.buffer.clone())
    }

    /// Adds a caller hold.
    pub fn retain(&mut self, id: LogicalObjectId) -> VmResult<()> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(VmError::UnknownObject(id))?;
        object.holds += 1;
        Ok(())
    }

    /// Drops a caller hold. Returns whether the object was destroyed.
    pub fn unhold(&mut self, id: LogicalObjectId) -> VmResult<bool> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(VmError::UnknownObject(id))?;
        if object.holds == 0 {
            return Err(VmError::InvalidState(format!("object {id} has no holds")));
        }
        object.holds -= 1;
        Ok(self.collect(id))
    }

    /// Shared with submitters so queued submissions keep their objects alive.
    pub(crate) fn pending_refs(&self) -> Arc<PendingRefs> {
        self.pending.clone()
    }

    /// Drops an admitted or rejected submission's queued references, then
    /// destroys whatever nothing else references.
    pub(crate) fn settle_pending(&mut self, objects: &[LogicalObjectId]) {
        self.pending.settle(objects);
        for object in objects {
            self.collect(*object);
        }
    }

    /// Takes an instruction reference, creating the object on first write.
    pub(crate) fn acquire_or_create(&mut self, id: LogicalObjectId) -> ObjectBuffer {
        let created = &mut self.created;
        let object = self.objects.entry(id).or_insert_with(|| {
            debug!(object = %id, "object created on first write");
            *created += 1;
            Object::new(Vec::new(), 0)
        });
        object.ref_count += 1;
        object.buffer.clone()
    }

    /// Takes an instruction reference on an existing object.
    pub(crate) fn acquire(&mut self, id: LogicalObjectId) -> Option<ObjectBuffer> {
        let object = self.objects.get_mut(&id)?;
        object.ref_count += 1;
        Some(object.buffer.clone())
    }

    /// Drops an instruction reference. Returns whether the object was destroyed.
    pub(crate) fn release(&mut self, id: LogicalObjectId) -> bool {
        match self.objects.get_mut(&id) {
            Some(object) if object.ref_count > 0 => {
                object.ref_count -= 1;
                self.collect(id)
            }
            _ => {
                lifecycle_violation!("released object {id} without an instruction reference")
            }
        }
    }

    /// Destroys the object if nothing references it any more.
    pub(crate) fn collect(&mut self, id: LogicalObjectId) -> bool {
        let unreferenced = self
            .objects
            .get(&id)
            .map(Object::is_unreferenced)
            .unwrap_or(false)
            && self.pending.count(id) == 0;
        if unreferenced {
            self.objects.remove(&id);
            self.destroyed += 1;
            trace!(object = %id, "object destroyed");
        }
        unreferenced
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }
}
