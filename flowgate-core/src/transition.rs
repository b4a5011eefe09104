//! Transitions and actions.
//!
//! A transition moves one state field from any of its `sources` to `target`.
//! An action runs the same guarded, locked pipeline but leaves the field
//! alone on success. Both hand their side effects to the engine's executor
//! and finish through [`Transition::complete_transition`] or
//! [`Transition::fail_transition`], which the executor calls later.

use crate::command::{Callbacks, Command, Condition, Conditions, Context, Permission, Permissions, SideEffects};
use crate::entity::Caller;
use crate::error::{CommandFailure, EngineError, NotAllowed};
use crate::events::{EventKind, Phase};
use crate::executor::{DispatchError, SideEffectJob};
use crate::process::{BoundProcess, Process};
use crate::state::State;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Whether a successful run writes the target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Transition,
    Action,
}

/// A guarded state change, or an action when there is no target.
#[derive(Debug)]
pub struct Transition {
    kind: TransitionKind,
    action_name: String,
    sources: BTreeSet<String>,
    target: Option<String>,
    in_progress_state: Option<String>,
    failed_state: Option<String>,
    conditions: Conditions,
    permissions: Permissions,
    side_effects: SideEffects,
    callbacks: Callbacks,
    failure_callbacks: Callbacks,
    next_transition: Option<String>,
}

impl Transition {
    /// Starts a transition definition. Without a target it builds an action.
    pub fn builder(action_name: impl Into<String>) -> TransitionBuilder {
        TransitionBuilder {
            action_name: action_name.into(),
            sources: BTreeSet::new(),
            target: None,
            in_progress_state: None,
            failed_state: None,
            conditions: Conditions::default(),
            permissions: Permissions::default(),
            side_effects: SideEffects::default(),
            callbacks: Callbacks::default(),
            failure_callbacks: Callbacks::default(),
            next_transition: None,
        }
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn is_action(&self) -> bool {
        self.kind == TransitionKind::Action
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn sources(&self) -> &BTreeSet<String> {
        &self.sources
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn in_progress_state(&self) -> Option<&str> {
        self.in_progress_state.as_deref()
    }

    pub fn failed_state(&self) -> Option<&str> {
        self.failed_state.as_deref()
    }

    pub fn next_transition(&self) -> Option<&str> {
        self.next_transition.as_deref()
    }

    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn side_effects(&self) -> &SideEffects {
        &self.side_effects
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    pub fn failure_callbacks(&self) -> &Callbacks {
        &self.failure_callbacks
    }

    /// Advisory check: not locked, permissions pass, conditions pass.
    ///
    /// Only the atomic lock inside `change_state` is authoritative.
    pub fn is_valid(&self, state: &State, user: Option<&Caller>) -> Result<bool, EngineError> {
        Ok(!state.is_locked()?
            && self.permissions.execute(state, user)?
            && self.conditions.execute(state)?)
    }

    /// `is_valid` plus the current state being one of the sources.
    pub fn is_available(&self, state: &State, user: Option<&Caller>) -> Result<bool, EngineError> {
        Ok(self.sources.contains(&state.cached_state()?) && self.is_valid(state, user)?)
    }

    /// Locks the state field, writes the in-progress state, and dispatches
    /// the side effects.
    ///
    /// Returns once the executor has accepted the job. With a queueing
    /// executor the transition completes or fails later.
    pub fn change_state(self: &Arc<Self>, state: &State, ctx: Context) -> Result<(), EngineError> {
        self.execute(state, ctx, None)
    }

    /// Like [`change_state`](Self::change_state), but resolves the chained
    /// next transition against `process`.
    pub(crate) fn change_state_within(
        self: &Arc<Self>,
        state: &State,
        ctx: Context,
        process: &Arc<Process>,
    ) -> Result<(), EngineError> {
        self.execute(state, ctx, Some(process.clone()))
    }

    fn execute(
        self: &Arc<Self>,
        state: &State,
        ctx: Context,
        process: Option<Arc<Process>>,
    ) -> Result<(), EngineError> {
        let engine = state.engine();
        let key = state.key();

        // Fast path; the lock below is what actually decides.
        if state.is_locked()? || !state.lock()? {
            tracing::info!(state = %key, action = %self.action_name, "state is locked");
            engine
                .events()
                .emit(key, &self.action_name, EventKind::LockRejected);
            return Err(EngineError::not_allowed(&self.action_name, NotAllowed::Locked));
        }
        engine.events().emit(key, &self.action_name, EventKind::Locked);

        let mut previous = None;
        if self.kind == TransitionKind::Transition {
            if let Some(in_progress) = &self.in_progress_state {
                previous = Some(state.cached_state()?);
                self.write_state(state, in_progress, Phase::InProgress)?;
            }
        }

        let this = self.clone();
        let success_engine = engine.clone();
        let success_key = key.clone();
        let on_success = move |ctx: Context| {
            let state = success_engine.state_for(success_key);
            this.complete_transition(&state, ctx, process.as_ref())
        };

        let this = self.clone();
        let failure_engine = engine.clone();
        let failure_key = key.clone();
        let on_failure = move |ctx: Context, failure: CommandFailure| {
            let state = failure_engine.state_for(failure_key);
            this.fail_transition(&state, failure, ctx)
        };

        let job = SideEffectJob::new(
            engine.clone(),
            key.clone(),
            self.action_name.clone(),
            ctx,
            self.side_effects.clone(),
            on_success,
            on_failure,
        );
        match engine.executor().dispatch(job) {
            Ok(()) => Ok(()),
            Err(DispatchError::Continuation(e)) => Err(e),
            Err(DispatchError::Rejected { reason }) => {
                self.abort_dispatch(state, previous.as_deref(), &reason)?;
                Err(EngineError::Executor(reason))
            }
        }
    }

    /// Undoes `execute` when the executor refused the job: moves to the
    /// failed state if there is one, else back to the value held before the
    /// in-progress write, then unlocks. No callbacks run.
    fn abort_dispatch(
        &self,
        state: &State,
        previous: Option<&str>,
        reason: &str,
    ) -> Result<(), EngineError> {
        let engine = state.engine();
        let key = state.key();

        tracing::warn!(state = %key, action = %self.action_name, reason, "side effects rejected by executor");
        match (&self.failed_state, previous) {
            (Some(failed), _) => self.write_state(state, failed, Phase::Failed)?,
            (None, Some(previous)) => self.write_state(state, previous, Phase::Failed)?,
            (None, None) => {}
        }
        state.unlock()?;
        engine.events().emit(key, &self.action_name, EventKind::Unlocked);
        engine.events().emit(
            key,
            &self.action_name,
            EventKind::Failed {
                error: format!("side-effect job rejected: {}", reason),
            },
        );
        Ok(())
    }

    /// Success path: writes the target, unlocks, runs callbacks, then the
    /// chained next transition.
    ///
    /// Actions skip the target write and never chain.
    pub fn complete_transition(
        &self,
        state: &State,
        mut ctx: Context,
        process: Option<&Arc<Process>>,
    ) -> Result<(), EngineError> {
        let engine = state.engine();
        let key = state.key();

        if let Some(target) = self.target.as_deref().filter(|_| !self.is_action()) {
            self.write_state(state, target, Phase::Completed)?;
        }
        state.unlock()?;
        engine.events().emit(key, &self.action_name, EventKind::Unlocked);
        engine.events().emit(key, &self.action_name, EventKind::Completed);
        tracing::info!(state = %key, action = %self.action_name, "transition completed");

        self.run_callbacks(state, &self.callbacks, &mut ctx, false);

        if self.is_action() {
            return Ok(());
        }
        if let Some(next) = &self.next_transition {
            self.chain(state, next, ctx, process);
        }
        Ok(())
    }

    /// Failure path: writes the failed state if any, unlocks, then runs the
    /// failure callbacks with the failure attached to the context.
    ///
    /// Without a failed state the field is left as it is. If the transition
    /// wrote an in-progress state, that value stays; it is not rolled back.
    pub fn fail_transition(
        &self,
        state: &State,
        failure: CommandFailure,
        mut ctx: Context,
    ) -> Result<(), EngineError> {
        let engine = state.engine();
        let key = state.key();

        tracing::warn!(
            state = %key,
            action = %self.action_name,
            command = %failure.command,
            error = %failure.error,
            "side effect failed"
        );
        if let Some(failed) = &self.failed_state {
            self.write_state(state, failed, Phase::Failed)?;
        }
        state.unlock()?;
        engine.events().emit(key, &self.action_name, EventKind::Unlocked);
        engine.events().emit(
            key,
            &self.action_name,
            EventKind::Failed {
                error: failure.to_string(),
            },
        );

        ctx.set_error(Arc::new(failure));
        self.run_callbacks(state, &self.failure_callbacks, &mut ctx, true);
        Ok(())
    }

    fn write_state(&self, state: &State, value: &str, phase: Phase) -> Result<(), EngineError> {
        let from = state.cached_state().ok();
        state.set_state(value)?;
        tracing::debug!(state = %state.key(), to = value, ?phase, "state changed");
        state.engine().events().emit(
            state.key(),
            &self.action_name,
            EventKind::StateChanged {
                from,
                to: value.to_string(),
                phase,
            },
        );
        Ok(())
    }

    fn run_callbacks(&self, state: &State, callbacks: &Callbacks, ctx: &mut Context, on_failure_path: bool) {
        if let Err(failure) = callbacks.execute(state, ctx) {
            tracing::error!(
                state = %state.key(),
                action = %self.action_name,
                command = %failure.command,
                error = %failure.error,
                "callback failed"
            );
            state.engine().events().emit(
                state.key(),
                &self.action_name,
                EventKind::CallbackFailed {
                    command: failure.command,
                    error: failure.error.to_string(),
                    on_failure_path,
                },
            );
        }
    }

    /// Runs `next` if exactly one transition with that name is available in
    /// the new state. Anything else is skipped without an error.
    fn chain(&self, state: &State, next: &str, mut ctx: Context, process: Option<&Arc<Process>>) {
        let engine = state.engine();
        let key = state.key();

        let process = match process {
            Some(process) => process.clone(),
            None => {
                engine.events().emit(
                    key,
                    &self.action_name,
                    EventKind::ChainSkipped {
                        next: next.to_string(),
                        matches: 0,
                    },
                );
                return;
            }
        };

        let bound = BoundProcess::new(process.clone(), engine.state_for(key.clone()));
        let user = ctx.user().cloned();
        let matches: Result<Vec<_>, _> = bound.available_transitions(user.as_ref(), Some(next)).collect();

        let result = match matches {
            Ok(matches) if matches.len() == 1 => {
                tracing::debug!(state = %key, from = %self.action_name, next, "chaining transition");
                ctx.clear_error();
                matches[0].change_state_within(bound.state(), ctx, &process)
            }
            Ok(matches) => {
                tracing::debug!(state = %key, next, matches = matches.len(), "chain skipped");
                engine.events().emit(
                    key,
                    &self.action_name,
                    EventKind::ChainSkipped {
                        next: next.to_string(),
                        matches: matches.len(),
                    },
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        // The chaining transition has already committed.
        if let Err(e) = result {
            tracing::warn!(state = %key, next, error = %e, "chained transition failed");
            engine.events().emit(
                key,
                next,
                EventKind::ContinuationFailed {
                    error: e.to_string(),
                },
            );
        }
    }
}

/// Builder for [`Transition`].
pub struct TransitionBuilder {
    action_name: String,
    sources: BTreeSet<String>,
    target: Option<String>,
    in_progress_state: Option<String>,
    failed_state: Option<String>,
    conditions: Conditions,
    permissions: Permissions,
    side_effects: SideEffects,
    callbacks: Callbacks,
    failure_callbacks: Callbacks,
    next_transition: Option<String>,
}

impl TransitionBuilder {
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.sources.insert(source.into());
        self
    }

    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn in_progress(mut self, state: impl Into<String>) -> Self {
        self.in_progress_state = Some(state.into());
        self
    }

    pub fn failed(mut self, state: impl Into<String>) -> Self {
        self.failed_state = Some(state.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn side_effect(mut self, command: Command) -> Self {
        self.side_effects.push(command);
        self
    }

    pub fn callback(mut self, command: Command) -> Self {
        self.callbacks.push(command);
        self
    }

    pub fn failure_callback(mut self, command: Command) -> Self {
        self.failure_callbacks.push(command);
        self
    }

    pub fn next(mut self, action_name: impl Into<String>) -> Self {
        self.next_transition = Some(action_name.into());
        self
    }

    pub fn build(self) -> Result<Arc<Transition>, EngineError> {
        let invalid = |reason: String| EngineError::InvalidDefinition { reason };

        if self.action_name.trim().is_empty() {
            return Err(invalid("action name must not be empty".to_string()));
        }
        if self.sources.is_empty() {
            return Err(invalid(format!(
                "transition '{}' has no source states",
                self.action_name
            )));
        }
        let kind = match self.target {
            Some(_) => TransitionKind::Transition,
            None => TransitionKind::Action,
        };
        if kind == TransitionKind::Action {
            if self.in_progress_state.is_some() {
                return Err(invalid(format!(
                    "action '{}' cannot have an in-progress state",
                    self.action_name
                )));
            }
            if self.next_transition.is_some() {
                return Err(invalid(format!(
                    "action '{}' cannot chain a next transition",
                    self.action_name
                )));
            }
        }

        Ok(Arc::new(Transition {
            kind,
            action_name: self.action_name,
            sources: self.sources,
            target: self.target,
            in_progress_state: self.in_progress_state,
            failed_state: self.failed_state,
            conditions: self.conditions,
            permissions: self.permissions,
            side_effects: self.side_effects,
            callbacks: self.callbacks,
            failure_callbacks: self.failure_callbacks,
            next_transition: self.next_transition,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::events::TransitionEvent;
    use crate::executor::SideEffectExecutor;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tokio::sync::broadcast;

    fn drain(rx: &mut broadcast::Receiver<TransitionEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    fn approve() -> Arc<Transition> {
        Transition::builder("approve")
            .source("draft")
            .target("approved")
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_validation() {
        assert!(Transition::builder("").source("draft").build().is_err());
        assert!(Transition::builder("approve").target("approved").build().is_err());
        assert!(Transition::builder("notify")
            .source("draft")
            .in_progress("notifying")
            .build()
            .is_err());
        assert!(Transition::builder("notify")
            .source("draft")
            .next("approve")
            .build()
            .is_err());

        let action = Transition::builder("notify").source("draft").build().unwrap();
        assert!(action.is_action());
        assert!(!approve().is_action());
    }

    #[test]
    fn test_change_state_to_target() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let mut rx = fx.engine.subscribe();
        let state = fx.engine.state("invoice", "inv-1", "status");

        approve().change_state(&state, Context::new()).unwrap();

        assert_eq!(state.get_db_state().unwrap(), "approved");
        assert!(!state.is_locked().unwrap());
        assert_eq!(
            drain(&mut rx),
            vec![
                EventKind::Locked,
                EventKind::StateChanged {
                    from: Some("draft".into()),
                    to: "approved".into(),
                    phase: Phase::Completed,
                },
                EventKind::Unlocked,
                EventKind::Completed,
            ]
        );
    }

    #[test]
    fn test_in_progress_visible_during_side_effects() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let seen = Arc::new(Mutex::new(None));

        let observed = seen.clone();
        let transition = Transition::builder("send")
            .source("draft")
            .in_progress("sending")
            .target("sent")
            .side_effect(Command::new("observe", move |state, _| {
                *observed.lock() = Some((state.get_db_state()?, state.is_locked()?));
                Ok(())
            }))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        transition.change_state(&state, Context::new()).unwrap();

        assert_eq!(*seen.lock(), Some(("sending".to_string(), true)));
        assert_eq!(state.get_db_state().unwrap(), "sent");
    }

    #[test]
    fn test_failed_side_effect_moves_to_failed_state() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let captured = Arc::new(Mutex::new(None));
        let after_failure = Arc::new(AtomicUsize::new(0));

        let capture = captured.clone();
        let counter = after_failure.clone();
        let transition = Transition::builder("approve")
            .source("draft")
            .target("approved")
            .failed("failed")
            .side_effect(Command::new("fail_invoice", |_, _| anyhow::bail!("declined")))
            .side_effect(Command::new("never", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .failure_callback(Command::new("record", move |_, ctx| {
                *capture.lock() = ctx.error().map(|f| f.command.clone());
                Ok(())
            }))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        transition.change_state(&state, Context::new()).unwrap();

        assert_eq!(state.get_db_state().unwrap(), "failed");
        assert!(!state.is_locked().unwrap());
        assert_eq!(*captured.lock(), Some("fail_invoice".to_string()));
        assert_eq!(after_failure.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_without_failed_state_keeps_value() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let transition = Transition::builder("send")
            .source("draft")
            .in_progress("sending")
            .target("sent")
            .side_effect(Command::new("fail_invoice", |_, _| anyhow::bail!("smtp down")))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        transition.change_state(&state, Context::new()).unwrap();

        assert_eq!(state.get_db_state().unwrap(), "sending");
        assert!(!state.is_locked().unwrap());
    }

    struct RefusingExecutor;

    impl SideEffectExecutor for RefusingExecutor {
        fn dispatch(&self, _job: SideEffectJob) -> Result<(), DispatchError> {
            Err(DispatchError::rejected("queue full"))
        }
    }

    fn send(runs: Arc<AtomicUsize>) -> TransitionBuilder {
        Transition::builder("send")
            .source("draft")
            .in_progress("sending")
            .target("sent")
            .side_effect(Command::new("send_invoice", move |_, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
    }

    #[test]
    fn test_rejected_dispatch_restores_previous_state() {
        let fx = fixture_with_executor(Arc::new(RefusingExecutor));
        fx.entities.insert(invoice("inv-1"));
        let mut rx = fx.engine.subscribe();
        let runs = Arc::new(AtomicUsize::new(0));
        let transition = send(runs.clone()).build().unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        let err = transition.change_state(&state, Context::new()).unwrap_err();

        assert!(matches!(err, EngineError::Executor(ref reason) if reason == "queue full"));
        assert_eq!(state.get_db_state().unwrap(), "draft");
        assert!(!state.is_locked().unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                EventKind::Locked,
                EventKind::StateChanged {
                    from: Some("draft".into()),
                    to: "sending".into(),
                    phase: Phase::InProgress,
                },
                EventKind::StateChanged {
                    from: Some("sending".into()),
                    to: "draft".into(),
                    phase: Phase::Failed,
                },
                EventKind::Unlocked,
                EventKind::Failed {
                    error: "side-effect job rejected: queue full".into(),
                },
            ]
        );

        let fresh = fx.engine.state("invoice", "inv-1", "status");
        assert!(transition.is_available(&fresh, None).unwrap());
    }

    #[test]
    fn test_rejected_dispatch_moves_to_failed_state() {
        let fx = fixture_with_executor(Arc::new(RefusingExecutor));
        fx.entities.insert(invoice("inv-1"));
        let runs = Arc::new(AtomicUsize::new(0));
        let transition = send(runs.clone()).failed("send_failed").build().unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        assert!(matches!(
            transition.change_state(&state, Context::new()),
            Err(EngineError::Executor(_))
        ));

        assert_eq!(state.get_db_state().unwrap(), "send_failed");
        assert!(!state.is_locked().unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_failure_is_swallowed() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let mut rx = fx.engine.subscribe();
        let transition = Transition::builder("approve")
            .source("draft")
            .target("approved")
            .callback(Command::new("notify", |_, _| anyhow::bail!("mailer down")))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        transition.change_state(&state, Context::new()).unwrap();

        assert_eq!(state.get_db_state().unwrap(), "approved");
        assert!(drain(&mut rx).contains(&EventKind::CallbackFailed {
            command: "notify".into(),
            error: "mailer down".into(),
            on_failure_path: false,
        }));
    }

    #[test]
    fn test_context_flows_to_callbacks() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let transition = Transition::builder("approve")
            .source("draft")
            .target("approved")
            .side_effect(Command::new("stamp", |_, ctx| {
                ctx.insert("approved_by", "finance");
                Ok(())
            }))
            .callback(Command::new("persist", |state, ctx| {
                let by = ctx.get("approved_by").cloned().unwrap_or_default();
                state.set_field("approved_by", by)?;
                Ok(())
            }))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        transition.change_state(&state, Context::new()).unwrap();

        let entity = state.refresh().unwrap();
        assert_eq!(entity.get("approved_by"), Some(&json!("finance")));
    }

    #[test]
    fn test_locked_state_rejected_without_side_effects() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let transition = Transition::builder("approve")
            .source("draft")
            .target("approved")
            .side_effect(Command::new("count", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        assert!(state.lock().unwrap());

        let err = transition.change_state(&state, Context::new()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransitionNotAllowed {
                reason: NotAllowed::Locked,
                ..
            }
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(state.get_db_state().unwrap(), "draft");
    }

    #[test]
    fn test_concurrent_callers_single_winner() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let ran = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let (counter, e, r) = (ran.clone(), entered.clone(), release.clone());
        let transition = Transition::builder("approve")
            .source("draft")
            .target("approved")
            .side_effect(Command::new("slow", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                e.wait();
                r.wait();
                Ok(())
            }))
            .build()
            .unwrap();

        let engine = fx.engine.clone();
        let winner = transition.clone();
        let handle = std::thread::spawn(move || {
            let state = engine.state("invoice", "inv-1", "status");
            winner.change_state(&state, Context::new())
        });

        entered.wait();
        let loser_state = fx.engine.state("invoice", "inv-1", "status");
        let err = transition
            .change_state(&loser_state, Context::new())
            .unwrap_err();
        assert!(err.is_not_allowed());
        release.wait();

        handle.join().unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(loser_state.get_db_state().unwrap(), "approved");
    }

    #[test]
    fn test_action_keeps_state() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let action = Transition::builder("remind")
            .source("draft")
            .side_effect(Command::new("email", |_, _| Ok(())))
            .callback(Command::new("count", move |state, _| {
                assert!(!state.is_locked()?);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        action.change_state(&state, Context::new()).unwrap();

        assert_eq!(state.get_db_state().unwrap(), "draft");
        assert!(!state.is_locked().unwrap());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_action_failure_may_move_to_failed_state() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let action = Transition::builder("remind")
            .source("draft")
            .failed("reminder_failed")
            .side_effect(Command::new("email", |_, _| anyhow::bail!("bounced")))
            .build()
            .unwrap();

        let state = fx.engine.state("invoice", "inv-1", "status");
        action.change_state(&state, Context::new()).unwrap();
        assert_eq!(state.get_db_state().unwrap(), "reminder_failed");
        assert!(!state.is_locked().unwrap());
    }

    #[test]
    fn test_is_available_checks_sources_and_guards() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1"));
        let state = fx.engine.state("invoice", "inv-1", "status");

        let staff_only = Transition::builder("approve")
            .source("draft")
            .target("approved")
            .permission(Permission::new("is_staff", |_, user| user.is("is_staff")))
            .build()
            .unwrap();
        let wrong_source = Transition::builder("pay")
            .source("approved")
            .target("paid")
            .build()
            .unwrap();

        let staff = Caller::new("u-1").with_attribute("is_staff", true);
        let guest = Caller::new("u-2");
        assert!(staff_only.is_available(&state, Some(&staff)).unwrap());
        assert!(!staff_only.is_available(&state, Some(&guest)).unwrap());
        assert!(staff_only.is_available(&state, None).unwrap());
        assert!(!wrong_source.is_available(&state, None).unwrap());

        assert!(state.lock().unwrap());
        assert!(!staff_only.is_valid(&state, Some(&staff)).unwrap());
    }
}
