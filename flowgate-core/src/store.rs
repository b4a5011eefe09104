//! Collaborator contracts for entity persistence and the shared lock store.
//!
//! The engine never persists entities itself. It reads and writes single
//! fields through [`EntityStore`] and takes per-field locks through
//! [`LockStore`]. In-memory implementations of both are provided for tests,
//! demos, and single-process deployments.

use crate::entity::Entity;
use crate::error::EngineError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Backing store for entities.
///
/// Implementations must be read-after-write consistent: a `get_field` issued
/// after a successful `set_field` observes the written value.
pub trait EntityStore: Send + Sync {
    /// Fetches a full entity snapshot.
    fn fetch(&self, kind: &str, id: &str) -> Result<Entity, EngineError>;

    /// Fetches one field directly from the store.
    fn get_field(&self, kind: &str, id: &str, field: &str) -> Result<Value, EngineError>;

    /// Writes one field.
    fn set_field(&self, kind: &str, id: &str, field: &str, value: Value)
        -> Result<(), EngineError>;
}

/// Shared mutual-exclusion store.
pub trait LockStore: Send + Sync {
    /// Sets `key` only if it is not already set. Returns true to exactly one
    /// of any number of concurrent callers.
    fn try_set(&self, key: &str, ttl: Duration) -> Result<bool, EngineError>;

    /// Removes `key` unconditionally.
    fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// Returns whether `key` is currently set. Advisory only.
    fn get(&self, key: &str) -> Result<bool, EngineError>;
}

/// In-memory entity store.
#[derive(Default)]
pub struct MemoryEntityStore {
    /// Entities indexed by (kind, id).
    entities: DashMap<(String, String), RwLock<Entity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity.
    pub fn insert(&self, entity: Entity) {
        let key = (entity.kind.clone(), entity.id.clone());
        self.entities.insert(key, RwLock::new(entity));
    }

    /// Removes an entity. Returns true if it existed.
    pub fn remove(&self, kind: &str, id: &str) -> bool {
        self.entities
            .remove(&(kind.to_string(), id.to_string()))
            .is_some()
    }

    /// Returns the number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn not_found(kind: &str, id: &str) -> EngineError {
        EngineError::EntityNotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

impl EntityStore for MemoryEntityStore {
    fn fetch(&self, kind: &str, id: &str) -> Result<Entity, EngineError> {
        self.entities
            .get(&(kind.to_string(), id.to_string()))
            .map(|r| r.read().clone())
            .ok_or_else(|| Self::not_found(kind, id))
    }

    fn get_field(&self, kind: &str, id: &str, field: &str) -> Result<Value, EngineError> {
        let entry = self
            .entities
            .get(&(kind.to_string(), id.to_string()))
            .ok_or_else(|| Self::not_found(kind, id))?;
        let entity = entry.read();
        entity
            .fields
            .get(field)
            .cloned()
            .ok_or_else(|| EngineError::FieldNotFound {
                kind: kind.to_string(),
                id: id.to_string(),
                field: field.to_string(),
            })
    }

    fn set_field(
        &self,
        kind: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let entry = self
            .entities
            .get(&(kind.to_string(), id.to_string()))
            .ok_or_else(|| Self::not_found(kind, id))?;
        entry.write().fields.insert(field.to_string(), value);
        Ok(())
    }
}

/// In-memory lock store with per-key expiry.
#[derive(Default)]
pub struct MemoryLockStore {
    /// Lock keys and their expiry instants.
    locks: DashMap<String, Instant>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of held (unexpired) locks.
    pub fn held(&self) -> usize {
        let now = Instant::now();
        self.locks.iter().filter(|r| *r.value() > now).count()
    }
}

impl LockStore for MemoryLockStore {
    fn try_set(&self, key: &str, ttl: Duration) -> Result<bool, EngineError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));

        // The entry guard holds the shard write lock, so check-and-set is atomic.
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    return Ok(false);
                }
                occupied.insert(expires_at);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires_at);
                Ok(true)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.locks.remove(key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<bool, EngineError> {
        Ok(self
            .locks
            .get(key)
            .map(|expires_at| *expires_at > Instant::now())
            .unwrap_or(false))
    }
}
