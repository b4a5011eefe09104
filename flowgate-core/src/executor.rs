//! Side-effect executors.
//!
//! A transition hands its side effects to an executor as a [`SideEffectJob`]:
//! the state key, the action name, the context, the steps to run, and two
//! continuations. Exactly one continuation runs when the steps finish. The
//! executor decides where and when that happens, so a transition must never
//! assume its side effects have finished when `change_state` returns.

use crate::command::{Context, SideEffects};
use crate::engine::Engine;
use crate::entity::StateKey;
use crate::error::{CommandFailure, EngineError};
use crate::events::EventKind;
use crate::state::State;
use std::fmt;
use thiserror::Error;
use tokio::runtime::Handle;

type OnSuccess = Box<dyn FnOnce(Context) -> Result<(), EngineError> + Send>;
type OnFailure = Box<dyn FnOnce(Context, CommandFailure) -> Result<(), EngineError> + Send>;

/// A unit of side-effect work plus its continuations.
pub struct SideEffectJob {
    engine: Engine,
    key: StateKey,
    action: String,
    context: Context,
    steps: SideEffects,
    on_success: OnSuccess,
    on_failure: OnFailure,
}

impl SideEffectJob {
    pub fn new(
        engine: Engine,
        key: StateKey,
        action: impl Into<String>,
        context: Context,
        steps: SideEffects,
        on_success: impl FnOnce(Context) -> Result<(), EngineError> + Send + 'static,
        on_failure: impl FnOnce(Context, CommandFailure) -> Result<(), EngineError> + Send + 'static,
    ) -> Self {
        Self {
            engine,
            key,
            action: action.into(),
            context,
            steps,
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Runs the steps against a freshly fetched state, then exactly one
    /// continuation. Returns the continuation's result.
    pub fn run(self) -> Result<(), EngineError> {
        let state = State::new(self.engine, self.key);
        let mut ctx = self.context;
        match self.steps.execute(&state, &mut ctx) {
            Ok(()) => (self.on_success)(ctx),
            Err(failure) => (self.on_failure)(ctx, failure),
        }
    }

    /// Runs the job where no caller is waiting for the result: continuation
    /// errors are logged and emitted instead of returned.
    pub fn run_detached(self) {
        let engine = self.engine.clone();
        let key = self.key.clone();
        let action = self.action.clone();
        if let Err(e) = self.run() {
            tracing::error!(state = %key, action = %action, error = %e, "side-effect continuation failed");
            engine.events().emit(
                &key,
                &action,
                EventKind::ContinuationFailed {
                    error: e.to_string(),
                },
            );
        }
    }
}

impl fmt::Debug for SideEffectJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideEffectJob")
            .field("key", &self.key)
            .field("action", &self.action)
            .field("steps", &self.steps)
            .finish()
    }
}

/// Why `dispatch` returned an error.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The job was refused. No step ran and neither continuation will run.
    #[error("side-effect job rejected: {reason}")]
    Rejected { reason: String },

    /// The job ran before `dispatch` returned and its continuation failed.
    #[error(transparent)]
    Continuation(EngineError),
}

impl DispatchError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        DispatchError::Rejected {
            reason: reason.into(),
        }
    }
}

/// Runs side-effect jobs.
pub trait SideEffectExecutor: Send + Sync {
    /// Accepts a job. Once it returns `Ok`, or `Err(Continuation)`, exactly
    /// one continuation has run or will run. `Err(Rejected)` means nothing
    /// ran and the caller still owns the lock.
    fn dispatch(&self, job: SideEffectJob) -> Result<(), DispatchError>;
}

/// Runs jobs on the calling thread before `dispatch` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl SideEffectExecutor for InlineExecutor {
    fn dispatch(&self, job: SideEffectJob) -> Result<(), DispatchError> {
        job.run().map_err(DispatchError::Continuation)
    }
}

/// Runs jobs on tokio's blocking thread pool.
///
/// `dispatch` returns as soon as the job is queued; completion or failure is
/// applied later from a pool thread, against a freshly fetched entity.
#[derive(Debug, Clone)]
pub struct BlockingPoolExecutor {
    handle: Handle,
}

impl BlockingPoolExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context.
    pub fn current() -> Result<Self, EngineError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| EngineError::Executor(e.to_string()))
    }
}

impl SideEffectExecutor for BlockingPoolExecutor {
    fn dispatch(&self, job: SideEffectJob) -> Result<(), DispatchError> {
        tracing::debug!(state = %job.key(), action = %job.action(), "queueing side effects");
        self.handle.spawn_blocking(move || job.run_detached());
        Ok(())
    }
}
