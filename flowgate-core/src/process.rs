//! Process trees.
//!
//! A [`Process`] is immutable data: guards, an ordered list of transitions and
//! an ordered list of nested processes. Binding it to one entity field gives a
//! [`BoundProcess`], which resolves and invokes transitions by action name.

use crate::command::{Condition, Conditions, Context, Permission, Permissions};
use crate::entity::Caller;
use crate::error::{EngineError, NotAllowed};
use crate::state::State;
use crate::transition::Transition;
use std::collections::BTreeSet;
use std::sync::Arc;

type TransitionIter<'a> = Box<dyn Iterator<Item = Result<Arc<Transition>, EngineError>> + 'a>;

/// A declarative node grouping transitions, guards and nested processes.
#[derive(Debug)]
pub struct Process {
    name: String,
    conditions: Conditions,
    permissions: Permissions,
    transitions: Vec<Arc<Transition>>,
    nested: Vec<Arc<Process>>,
}

impl Process {
    pub fn builder(name: impl Into<String>) -> ProcessBuilder {
        ProcessBuilder {
            process: Process {
                name: name.into(),
                conditions: Conditions::default(),
                permissions: Permissions::default(),
                transitions: Vec::new(),
                nested: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn transitions(&self) -> &[Arc<Transition>] {
        &self.transitions
    }

    pub fn nested(&self) -> &[Arc<Process>] {
        &self.nested
    }

    /// Guards of this node only. Descendants are checked as they are walked.
    pub fn is_valid(&self, state: &State, user: Option<&Caller>) -> Result<bool, EngineError> {
        Ok(self.permissions.execute(state, user)? && self.conditions.execute(state)?)
    }

    /// Every state value mentioned anywhere in the tree.
    pub fn all_states(&self) -> BTreeSet<String> {
        let mut states = BTreeSet::new();
        self.visit(&mut |t| {
            states.extend(t.sources().iter().cloned());
            states.extend(
                [t.target(), t.in_progress_state(), t.failed_state()]
                    .into_iter()
                    .flatten()
                    .map(str::to_string),
            );
        });
        states
    }

    /// Every state a transition in the tree can write: targets plus
    /// in-progress and failed states.
    pub fn target_states(&self) -> BTreeSet<String> {
        let mut states = BTreeSet::new();
        self.visit(&mut |t| {
            states.extend(
                [t.target(), t.in_progress_state(), t.failed_state()]
                    .into_iter()
                    .flatten()
                    .map(str::to_string),
            )
        });
        states
    }

    /// Finds a descendant process by name, depth-first.
    pub fn find(&self, name: &str) -> Option<&Arc<Process>> {
        self.nested.iter().find_map(|child| {
            if child.name == name {
                Some(child)
            } else {
                child.find(name)
            }
        })
    }

    fn visit(&self, f: &mut dyn FnMut(&Transition)) {
        for transition in &self.transitions {
            f(transition);
        }
        for child in &self.nested {
            child.visit(f);
        }
    }

    /// Lazy depth-first walk. A node whose guards fail is pruned together
    /// with everything beneath it.
    fn walk<'a>(
        &'a self,
        state: &'a State,
        user: Option<&'a Caller>,
        action: Option<&'a str>,
    ) -> TransitionIter<'a> {
        match self.is_valid(state, user) {
            Ok(true) => {}
            Ok(false) => return Box::new(std::iter::empty()),
            Err(e) => return Box::new(std::iter::once(Err(e))),
        }

        let local = self
            .transitions
            .iter()
            .filter(move |t| action.map_or(true, |a| t.action_name() == a))
            .filter_map(move |t| match t.is_available(state, user) {
                Ok(true) => Some(Ok(t.clone())),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            });
        let nested = self
            .nested
            .iter()
            .flat_map(move |child| child.walk(state, user, action));

        Box::new(local.chain(nested))
    }
}

/// Builder for [`Process`].
pub struct ProcessBuilder {
    process: Process,
}

impl ProcessBuilder {
    pub fn condition(mut self, condition: Condition) -> Self {
        self.process.conditions.push(condition);
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.process.permissions.push(permission);
        self
    }

    pub fn transition(mut self, transition: Arc<Transition>) -> Self {
        self.process.transitions.push(transition);
        self
    }

    pub fn nested(mut self, process: Arc<Process>) -> Self {
        self.process.nested.push(process);
        self
    }

    pub fn build(self) -> Arc<Process> {
        Arc::new(self.process)
    }
}

/// A process tree bound to one entity field.
#[derive(Debug)]
pub struct BoundProcess {
    process: Arc<Process>,
    state: State,
}

impl BoundProcess {
    pub fn new(process: Arc<Process>, state: State) -> Self {
        Self { process, state }
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_valid(&self, user: Option<&Caller>) -> Result<bool, EngineError> {
        self.process.is_valid(&self.state, user)
    }

    /// Transitions available for `user` in the current state, optionally
    /// filtered by action name.
    ///
    /// Order: this node's transitions as declared, then each nested process
    /// depth-first. Nothing is memoized between calls.
    pub fn available_transitions<'a>(
        &'a self,
        user: Option<&'a Caller>,
        action: Option<&'a str>,
    ) -> TransitionIter<'a> {
        self.process.walk(&self.state, user, action)
    }

    /// Sorted names of the actions `user` may invoke right now.
    pub fn available_actions(&self, user: Option<&Caller>) -> Result<BTreeSet<String>, EngineError> {
        self.available_transitions(user, None)
            .map(|t| t.map(|t| t.action_name().to_string()))
            .collect()
    }

    /// Invokes the single available transition named `action`.
    ///
    /// Zero or several matches are refused; the engine never picks between
    /// candidates.
    pub fn invoke(&self, action: &str, user: Option<&Caller>, ctx: Context) -> Result<(), EngineError> {
        let matches = self
            .available_transitions(user, Some(action))
            .collect::<Result<Vec<_>, _>>()?;

        let transition = match matches.as_slice() {
            [transition] => transition.clone(),
            [] => {
                tracing::debug!(state = %self.state.key(), action, "no available transition");
                return Err(EngineError::not_allowed(action, NotAllowed::NoMatch));
            }
            _ => {
                tracing::warn!(
                    state = %self.state.key(),
                    action,
                    matches = matches.len(),
                    "ambiguous transition"
                );
                return Err(EngineError::not_allowed(
                    action,
                    NotAllowed::Ambiguous {
                        matches: matches.len(),
                    },
                ));
            }
        };

        let ctx = ctx.with_user(user.cloned());
        transition.change_state_within(&self.state, ctx, &self.process)?;
        self.state.refresh()?;
        Ok(())
    }
}
