//! State view over one entity field.

use crate::engine::Engine;
use crate::entity::{Entity, StateKey};
use crate::error::EngineError;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A transient view over one state field of one entity.
///
/// The entity is fetched at most once per `State` and memoized; every write
/// goes through to the entity store and refreshes the memoized copy. The lock
/// lives in the engine's shared [`LockStore`](crate::store::LockStore) under
/// a key derived from (kind, field, id), so independent fields of the same
/// entity never contend.
pub struct State {
    engine: Engine,
    key: StateKey,
    cached: Mutex<Option<Arc<Entity>>>,
}

impl State {
    pub fn new(engine: Engine, key: StateKey) -> Self {
        Self {
            engine,
            key,
            cached: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Reads the state field straight from the store, bypassing the cache.
    pub fn get_db_state(&self) -> Result<String, EngineError> {
        let value =
            self.engine
                .entities()
                .get_field(&self.key.kind, &self.key.id, &self.key.field)?;
        self.state_value(&value)
    }

    /// Returns the memoized entity, fetching it on first use.
    pub fn entity(&self) -> Result<Arc<Entity>, EngineError> {
        let mut cached = self.cached.lock();
        if let Some(entity) = cached.as_ref() {
            return Ok(entity.clone());
        }
        let entity = Arc::new(self.engine.entities().fetch(&self.key.kind, &self.key.id)?);
        *cached = Some(entity.clone());
        Ok(entity)
    }

    /// Returns the state value of the memoized entity.
    pub fn cached_state(&self) -> Result<String, EngineError> {
        let entity = self.entity()?;
        let value = entity
            .get(&self.key.field)
            .ok_or_else(|| EngineError::FieldNotFound {
                kind: self.key.kind.clone(),
                id: self.key.id.clone(),
                field: self.key.field.clone(),
            })?;
        self.state_value(value)
    }

    /// Writes the state field and refreshes the memoized entity.
    pub fn set_state(&self, value: &str) -> Result<(), EngineError> {
        self.set_field(&self.key.field, Value::String(value.to_string()))
    }

    /// Writes any field of the wrapped entity and refreshes the memoized copy.
    ///
    /// Side effects and callbacks use this to persist their own changes.
    pub fn set_field(&self, field: &str, value: impl Into<Value>) -> Result<(), EngineError> {
        self.engine
            .entities()
            .set_field(&self.key.kind, &self.key.id, field, value.into())?;
        self.refresh()?;
        Ok(())
    }

    /// Re-reads the entity from the store into the memoized copy.
    pub fn refresh(&self) -> Result<Arc<Entity>, EngineError> {
        let entity = Arc::new(self.engine.entities().fetch(&self.key.kind, &self.key.id)?);
        *self.cached.lock() = Some(entity.clone());
        Ok(entity)
    }

    /// Takes the lock for this state field.
    ///
    /// Returns true only to the single caller that set the key; this return
    /// value is the authoritative guard against concurrent transitions.
    pub fn lock(&self) -> Result<bool, EngineError> {
        let acquired = self
            .engine
            .locks()
            .try_set(&self.lock_key(), self.engine.config().locks.ttl())?;
        if acquired {
            tracing::debug!(state = %self.key, "state locked");
        }
        Ok(acquired)
    }

    /// Releases the lock unconditionally.
    pub fn unlock(&self) -> Result<(), EngineError> {
        self.engine.locks().delete(&self.lock_key())?;
        tracing::debug!(state = %self.key, "state unlocked");
        Ok(())
    }

    /// Best-effort lock check. May race with concurrent `lock` calls.
    pub fn is_locked(&self) -> Result<bool, EngineError> {
        self.engine.locks().get(&self.lock_key())
    }

    /// Deterministic lock key for (kind, field, id).
    pub fn lock_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.key.field.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.key.id.as_bytes());
        format!(
            "{}:{}",
            self.engine.config().locks.key_prefix,
            hex::encode(hasher.finalize())
        )
    }

    fn state_value(&self, value: &Value) -> Result<String, EngineError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::InvalidStateValue {
                field: self.key.field.clone(),
            })
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State").field("key", &self.key).finish()
    }
}
