//! Binding layer: which process drives which field of which entity kind.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::process::{BoundProcess, Process};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Clone)]
struct Binding {
    field: String,
    process: Arc<Process>,
}

/// Registry of process bindings per entity kind.
///
/// A binding maps `(kind, name)` to a state field and a process tree; looking
/// it up for a concrete entity id yields a [`BoundProcess`].
pub struct ProcessManager {
    engine: Engine,
    bindings: DashMap<(String, String), Binding>,
}

impl ProcessManager {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            bindings: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Binds `process` to `field` of every `kind` entity, under the process's
    /// own name. Rebinding a name replaces the previous binding.
    pub fn bind(&self, kind: impl Into<String>, field: impl Into<String>, process: Arc<Process>) {
        let name = process.name().to_string();
        self.bind_as(kind.into(), name, field.into(), process);
    }

    /// Binds one process per state field, each exposed as `"{field}_process"`.
    pub fn bind_state_fields<I, F>(&self, kind: impl Into<String>, fields: I)
    where
        I: IntoIterator<Item = (F, Arc<Process>)>,
        F: Into<String>,
    {
        let kind = kind.into();
        for (field, process) in fields {
            let field = field.into();
            let name = format!("{}_process", field);
            self.bind_as(kind.clone(), name, field, process);
        }
    }

    fn bind_as(&self, kind: String, name: String, field: String, process: Arc<Process>) {
        tracing::debug!(kind = %kind, name = %name, field = %field, "binding process");
        let previous = self
            .bindings
            .insert((kind.clone(), name.clone()), Binding { field, process });
        if previous.is_some() {
            tracing::warn!(kind = %kind, name = %name, "process binding replaced");
        }
    }

    /// Returns the named process bound to one entity.
    pub fn process(&self, kind: &str, id: &str, name: &str) -> Result<BoundProcess, EngineError> {
        let binding = self
            .bindings
            .get(&(kind.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::ProcessNotBound {
                kind: kind.to_string(),
                process: name.to_string(),
            })?;
        Ok(self.engine.bind(binding.process, kind, id, binding.field))
    }

    /// Sorted names of the processes bound to `kind`.
    pub fn processes_for(&self, kind: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        names
    }

    /// The state field a binding drives.
    pub fn field_of(&self, kind: &str, name: &str) -> Option<String> {
        self.bindings
            .get(&(kind.to_string(), name.to_string()))
            .map(|entry| entry.field.clone())
    }
}

/// Generates a trait with one method per action, implemented for
/// [`BoundProcess`](crate::BoundProcess). Each method calls `invoke` with the
/// method's name as the action name.
///
/// ```
/// flowgate_core::process_actions! {
///     pub trait LockerActions { lock, unlock }
/// }
/// ```
#[macro_export]
macro_rules! process_actions {
    ($(#[$meta:meta])* $vis:vis trait $name:ident { $($action:ident),* $(,)? }) => {
        $(#[$meta])*
        $vis trait $name {
            $(
                fn $action(
                    &self,
                    user: Option<&$crate::Caller>,
                    ctx: $crate::Context,
                ) -> Result<(), $crate::EngineError>;
            )*
        }

        impl $name for $crate::BoundProcess {
            $(
                fn $action(
                    &self,
                    user: Option<&$crate::Caller>,
                    ctx: $crate::Context,
                ) -> Result<(), $crate::EngineError> {
                    self.invoke(stringify!($action), user, ctx)
                }
            )*
        }
    };
}
