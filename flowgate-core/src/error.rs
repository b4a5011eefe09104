//! Core error types.

use std::fmt;
use thiserror::Error;

/// Why a transition was refused before any side effect ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotAllowed {
    /// Another transition holds the lock on this state field.
    Locked,
    /// No available transition carries the requested action name.
    NoMatch,
    /// More than one available transition carries the requested action name.
    Ambiguous { matches: usize },
}

impl fmt::Display for NotAllowed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotAllowed::Locked => write!(f, "state is locked"),
            NotAllowed::NoMatch => write!(f, "no available transition"),
            NotAllowed::Ambiguous { matches } => {
                write!(f, "{} transitions available, expected exactly one", matches)
            }
        }
    }
}

/// Errors from the process engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transition '{action}' not allowed: {reason}")]
    TransitionNotAllowed { action: String, reason: NotAllowed },

    #[error("entity not found: {kind}/{id}")]
    EntityNotFound { kind: String, id: String },

    #[error("field '{field}' not found on {kind}/{id}")]
    FieldNotFound {
        kind: String,
        id: String,
        field: String,
    },

    #[error("state field '{field}' does not hold a string value")]
    InvalidStateValue { field: String },

    #[error("process '{process}' is not bound to entity kind '{kind}'")]
    ProcessNotBound { kind: String, process: String },

    #[error("invalid process definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("entity store error: {0}")]
    Store(String),

    #[error("lock store error: {0}")]
    LockStore(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Shorthand for a refused transition.
    pub fn not_allowed(action: impl Into<String>, reason: NotAllowed) -> Self {
        EngineError::TransitionNotAllowed {
            action: action.into(),
            reason,
        }
    }

    /// Returns true if this is a `TransitionNotAllowed` error.
    pub fn is_not_allowed(&self) -> bool {
        matches!(self, EngineError::TransitionNotAllowed { .. })
    }

    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::LockStore(_))
    }

    /// Returns a stable error code for callers that surface errors externally.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::TransitionNotAllowed { .. } => "TRANSITION_NOT_ALLOWED",
            EngineError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            EngineError::FieldNotFound { .. } => "FIELD_NOT_FOUND",
            EngineError::InvalidStateValue { .. } => "INVALID_STATE_VALUE",
            EngineError::ProcessNotBound { .. } => "PROCESS_NOT_BOUND",
            EngineError::InvalidDefinition { .. } => "BAD_REQUEST",
            EngineError::InvalidGuard { .. } => "BAD_REQUEST",
            EngineError::UnknownCommand { .. } => "BAD_REQUEST",
            EngineError::Store(_) => "STORE_ERROR",
            EngineError::LockStore(_) => "LOCK_STORE_ERROR",
            EngineError::Executor(_) => "EXECUTOR_ERROR",
            EngineError::Json(_) => "BAD_REQUEST",
            EngineError::Yaml(_) => "BAD_REQUEST",
        }
    }
}

/// A side effect or callback that returned an error.
///
/// Keeps the name of the failing command next to the error it produced so
/// failure callbacks and event consumers can tell which step broke.
#[derive(Debug, Error)]
#[error("command '{command}' failed: {error}")]
pub struct CommandFailure {
    pub command: String,
    pub error: anyhow::Error,
}

impl CommandFailure {
    pub fn new(command: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            command: command.into(),
            error,
        }
    }
}
