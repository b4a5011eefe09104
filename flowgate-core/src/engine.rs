//! Engine - holds the injected collaborators every state view needs.

use crate::config::EngineConfig;
use crate::entity::StateKey;
use crate::events::{EventBus, TransitionEvent};
use crate::executor::{InlineExecutor, SideEffectExecutor};
use crate::process::{BoundProcess, Process};
use crate::state::State;
use crate::store::{EntityStore, LockStore};
use std::sync::Arc;
use tokio::sync::broadcast;

struct EngineInner {
    config: EngineConfig,
    entities: Arc<dyn EntityStore>,
    locks: Arc<dyn LockStore>,
    executor: Arc<dyn SideEffectExecutor>,
    events: EventBus,
}

/// The process engine.
///
/// Cheap to clone; every clone shares the same stores, executor and event
/// stream. Nothing here is global: tests and applications construct as many
/// independent engines as they like.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine that runs side effects inline.
    pub fn new(
        config: EngineConfig,
        entities: Arc<dyn EntityStore>,
        locks: Arc<dyn LockStore>,
    ) -> Self {
        Self::builder(entities, locks).config(config).build()
    }

    /// Starts building an engine around the given stores.
    pub fn builder(entities: Arc<dyn EntityStore>, locks: Arc<dyn LockStore>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            entities,
            locks,
            executor: None,
        }
    }

    /// Returns a state view over one entity field.
    pub fn state(
        &self,
        kind: impl Into<String>,
        id: impl Into<String>,
        field: impl Into<String>,
    ) -> State {
        State::new(self.clone(), StateKey::new(kind, id, field))
    }

    /// Returns a state view for an existing key.
    pub fn state_for(&self, key: StateKey) -> State {
        State::new(self.clone(), key)
    }

    /// Binds a process tree to one entity field.
    pub fn bind(
        &self,
        process: Arc<Process>,
        kind: impl Into<String>,
        id: impl Into<String>,
        field: impl Into<String>,
    ) -> BoundProcess {
        BoundProcess::new(process, self.state(kind, id, field))
    }

    /// Subscribes to the domain event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.inner.entities
    }

    pub fn locks(&self) -> &Arc<dyn LockStore> {
        &self.inner.locks
    }

    pub fn executor(&self) -> &Arc<dyn SideEffectExecutor> {
        &self.inner.executor
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    entities: Arc<dyn EntityStore>,
    locks: Arc<dyn LockStore>,
    executor: Option<Arc<dyn SideEffectExecutor>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the side-effect executor (inline by default).
    pub fn executor(mut self, executor: Arc<dyn SideEffectExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Engine {
        let events = EventBus::new(self.config.events.channel_capacity);
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(InlineExecutor) as Arc<dyn SideEffectExecutor>);

        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                entities: self.entities,
                locks: self.locks,
                executor,
                events,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for the crate's unit tests.

    use super::*;
    use crate::entity::Entity;
    use crate::store::{MemoryEntityStore, MemoryLockStore};

    pub(crate) struct Fixture {
        pub engine: Engine,
        pub entities: Arc<MemoryEntityStore>,
        pub locks: Arc<MemoryLockStore>,
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with_executor(Arc::new(InlineExecutor))
    }

    pub(crate) fn fixture_with_executor(executor: Arc<dyn SideEffectExecutor>) -> Fixture {
        let entities = Arc::new(MemoryEntityStore::new());
        let locks = Arc::new(MemoryLockStore::new());
        let engine = Engine::builder(entities.clone(), locks.clone())
            .executor(executor)
            .build();
        Fixture {
            engine,
            entities,
            locks,
        }
    }

    /// An invoice in `draft`, available, not yet received by the customer.
    pub(crate) fn invoice(id: &str) -> Entity {
        Entity::new("invoice", id)
            .with_field("status", "draft")
            .with_field("is_available", true)
            .with_field("customer_received", false)
    }
}
