//! # flowgate-core
//!
//! Declarative process engine for entity state fields.
//!
//! This crate provides:
//! - Process trees of guarded transitions and actions
//! - Race-free per-field locking through an injected lock store
//! - Side effects, callbacks and failure callbacks with pluggable executors
//! - Guard expressions and JSON/YAML process definitions
//! - A domain event stream for observability consumers

pub mod command;
pub mod config;
pub mod definition;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod executor;
pub mod guard;
pub mod manager;
pub mod process;
pub mod state;
pub mod store;
pub mod transition;

pub use command::{
    Callbacks, Command, CommandRegistry, Condition, Conditions, Context, Permission, Permissions,
    SideEffects,
};
pub use config::{ConfigError, EngineConfig, ExecutorMode};
pub use definition::{ProcessDefinition, TransitionDefinition};
pub use engine::{Engine, EngineBuilder};
pub use entity::{Caller, Entity, StateKey};
pub use error::{CommandFailure, EngineError, NotAllowed};
pub use events::{EventBus, EventKind, Phase, TransitionEvent};
pub use executor::{
    BlockingPoolExecutor, DispatchError, InlineExecutor, SideEffectExecutor, SideEffectJob,
};
pub use guard::GuardExpr;
pub use manager::ProcessManager;
pub use process::{BoundProcess, Process, ProcessBuilder};
pub use state::State;
pub use store::{EntityStore, LockStore, MemoryEntityStore, MemoryLockStore};
pub use transition::{Transition, TransitionBuilder, TransitionKind};
