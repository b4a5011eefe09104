//! Command groups: conditions, permissions, side effects and callbacks.
//!
//! Each group is an ordered list of named functions. Conditions and
//! permissions are predicates; side effects and callbacks are fallible
//! actions that run against a [`State`] and a mutable [`Context`].

use crate::entity::{Caller, Entity};
use crate::error::{CommandFailure, EngineError};
use crate::guard::{GuardExpr, Scope};
use crate::state::State;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type ConditionFn = dyn Fn(&Entity) -> bool + Send + Sync;
type PermissionFn = dyn Fn(&Entity, &Caller) -> bool + Send + Sync;
type CommandFn = dyn Fn(&State, &mut Context) -> anyhow::Result<()> + Send + Sync;

/// Values passed along a transition: the caller, free-form data, and on the
/// failure path the side-effect failure that caused it.
#[derive(Debug, Clone, Default)]
pub struct Context {
    user: Option<Caller>,
    data: Map<String, Value>,
    error: Option<Arc<CommandFailure>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style data setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: Option<Caller>) -> Self {
        self.user = user;
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// The caller the transition was invoked for, if any.
    pub fn user(&self) -> Option<&Caller> {
        self.user.as_ref()
    }

    /// The side-effect failure, present only while failure callbacks run.
    pub fn error(&self) -> Option<&CommandFailure> {
        self.error.as_deref()
    }

    pub(crate) fn set_error(&mut self, error: Arc<CommandFailure>) {
        self.error = Some(error);
    }

    pub(crate) fn clear_error(&mut self) {
        self.error = None;
    }
}

/// An entity-only predicate.
#[derive(Clone)]
pub struct Condition {
    name: String,
    check: Arc<ConditionFn>,
}

impl Condition {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Entity) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Builds a condition from a guard expression over `ctx.` fields.
    pub fn guard(expr: &str) -> Result<Self, EngineError> {
        let guard = GuardExpr::parse(expr)?;
        if guard.references_user() {
            return Err(EngineError::InvalidGuard {
                reason: format!("condition '{}' may not reference 'user.'", expr),
            });
        }
        Ok(Self::new(expr, move |entity| {
            guard.evaluate(&Scope::new(entity, None))
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, entity: &Entity) -> bool {
        (self.check)(entity)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.name).finish()
    }
}

/// An entity + caller predicate.
#[derive(Clone)]
pub struct Permission {
    name: String,
    check: Arc<PermissionFn>,
}

impl Permission {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Entity, &Caller) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Builds a permission from a guard expression over `ctx.` and `user.`.
    pub fn guard(expr: &str) -> Result<Self, EngineError> {
        let guard = GuardExpr::parse(expr)?;
        Ok(Self::new(expr, move |entity, caller| {
            guard.evaluate(&Scope::new(entity, Some(caller)))
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, entity: &Entity, caller: &Caller) -> bool {
        (self.check)(entity, caller)
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Permission").field(&self.name).finish()
    }
}

/// A side effect or callback.
#[derive(Clone)]
pub struct Command {
    name: String,
    run: Arc<CommandFn>,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        run: impl Fn(&State, &mut Context) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Arc::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, state: &State, ctx: &mut Context) -> anyhow::Result<()> {
        (self.run)(state, ctx)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Command").field(&self.name).finish()
    }
}

/// AND of entity predicates. Empty = true.
#[derive(Debug, Clone, Default)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new(commands: Vec<Condition>) -> Self {
        Self(commands)
    }

    pub fn commands(&self) -> &[Condition] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, condition: Condition) {
        self.0.push(condition);
    }

    pub fn execute(&self, state: &State) -> Result<bool, EngineError> {
        if self.0.is_empty() {
            return Ok(true);
        }
        let entity = state.entity()?;
        Ok(self.0.iter().all(|c| c.check(&entity)))
    }
}

/// AND of entity + caller predicates.
///
/// A `None` caller is a trusted internal call: permissions pass without
/// being evaluated.
#[derive(Debug, Clone, Default)]
pub struct Permissions(Vec<Permission>);

impl Permissions {
    pub fn new(commands: Vec<Permission>) -> Self {
        Self(commands)
    }

    pub fn commands(&self) -> &[Permission] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, permission: Permission) {
        self.0.push(permission);
    }

    pub fn execute(&self, state: &State, user: Option<&Caller>) -> Result<bool, EngineError> {
        let user = match user {
            Some(user) => user,
            None => return Ok(true),
        };
        if self.0.is_empty() {
            return Ok(true);
        }
        let entity = state.entity()?;
        Ok(self.0.iter().all(|p| p.check(&entity, user)))
    }
}

/// Ordered side effects. Stops at the first failure.
///
/// The owning transition decides what success or failure means; see
/// [`SideEffectJob`](crate::executor::SideEffectJob).
#[derive(Debug, Clone, Default)]
pub struct SideEffects(Vec<Command>);

impl SideEffects {
    pub fn new(commands: Vec<Command>) -> Self {
        Self(commands)
    }

    pub fn commands(&self) -> &[Command] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, command: Command) {
        self.0.push(command);
    }

    pub fn execute(&self, state: &State, ctx: &mut Context) -> Result<(), CommandFailure> {
        run_in_order(&self.0, state, ctx)
    }
}

/// Ordered best-effort callbacks. Stops at the first failure and reports it;
/// the caller logs it and carries on, since the transition has committed.
#[derive(Debug, Clone, Default)]
pub struct Callbacks(Vec<Command>);

impl Callbacks {
    pub fn new(commands: Vec<Command>) -> Self {
        Self(commands)
    }

    pub fn commands(&self) -> &[Command] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, command: Command) {
        self.0.push(command);
    }

    pub fn execute(&self, state: &State, ctx: &mut Context) -> Result<(), CommandFailure> {
        run_in_order(&self.0, state, ctx)
    }
}

fn run_in_order(commands: &[Command], state: &State, ctx: &mut Context) -> Result<(), CommandFailure> {
    for command in commands {
        command
            .run(state, ctx)
            .map_err(|e| CommandFailure::new(command.name(), e))?;
    }
    Ok(())
}

/// Named commands and predicates that declarative definitions refer to.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    conditions: HashMap<String, Condition>,
    permissions: HashMap<String, Permission>,
    commands: HashMap<String, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_condition(&mut self, condition: Condition) -> &mut Self {
        self.conditions
            .insert(condition.name().to_string(), condition);
        self
    }

    pub fn register_permission(&mut self, permission: Permission) -> &mut Self {
        self.permissions
            .insert(permission.name().to_string(), permission);
        self
    }

    /// Registers a command usable as a side effect or callback.
    pub fn register_command(&mut self, command: Command) -> &mut Self {
        self.commands.insert(command.name().to_string(), command);
        self
    }

    /// Resolves a registered condition, or parses `name` as a guard.
    pub fn condition(&self, name: &str) -> Result<Condition, EngineError> {
        match self.conditions.get(name) {
            Some(condition) => Ok(condition.clone()),
            None => Condition::guard(name),
        }
    }

    /// Resolves a registered permission, or parses `name` as a guard.
    pub fn permission(&self, name: &str) -> Result<Permission, EngineError> {
        match self.permissions.get(name) {
            Some(permission) => Ok(permission.clone()),
            None => Permission::guard(name),
        }
    }

    pub fn command(&self, name: &str) -> Result<Command, EngineError> {
        self.commands
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownCommand {
                name: name.to_string(),
            })
    }
}
