//! Shared store of reconciled domain objects.
//!
//! Holds at most one value per domain id. Consumers can subscribe to
//! changes.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use xapi_fleet_core::ObjectId;

use crate::types::DomainObject;

const CHANGE_CAPACITY: usize = 1024;

/// A change to the object store.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectChange {
    /// An object was inserted or replaced.
    Set(DomainObject),
    /// An object was removed.
    Unset(ObjectId),
}

/// Mapping from domain id to domain object.
pub trait ObjectStore: Send + Sync {
    /// Get an object by id.
    fn get(&self, id: &ObjectId) -> Option<DomainObject>;

    /// Insert or replace an object.
    fn set(&self, object: DomainObject);

    /// Remove an object, returning it if it was present.
    fn unset(&self, id: &ObjectId) -> Option<DomainObject>;

    /// All objects, in no particular order.
    fn all(&self) -> Vec<DomainObject>;

    /// Subscribe to subsequent changes.
    fn subscribe(&self) -> broadcast::Receiver<ObjectChange>;
}

/// In-memory object store.
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, DomainObject>>,
    changes: broadcast::Sender<ObjectChange>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, id: &ObjectId) -> Option<DomainObject> {
        self.objects.read().get(id).cloned()
    }

    fn set(&self, object: DomainObject) {
        self.objects.write().insert(object.id.clone(), object.clone());
        // No receivers is fine.
        let _ = self.changes.send(ObjectChange::Set(object));
    }

    fn unset(&self, id: &ObjectId) -> Option<DomainObject> {
        let removed = self.objects.write().remove(id);
        if removed.is_some() {
            let _ = self.changes.send(ObjectChange::Unset(id.clone()));
        }
        removed
    }

    fn all(&self) -> Vec<DomainObject> {
        self.objects.read().values().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        self.changes.subscribe()
    }
}
