//! Error types for the notification engine.
//!
//! There are three kinds of failure:
//!
//! - [`Error::Signature`]: a listener declares more arguments than the
//!   engine can project. Raised at registration time.
//! - [`HandlerStackError`]: misuse of the per-thread exception handler
//!   stack (popping the last record, mutating a locked stack). Always
//!   propagates to its direct caller.
//! - [`ListenerFailure`]: anything a listener raised while being notified.
//!   These never reach the caller of `notify` unless the active handler
//!   record asks for them to be re-raised.

use std::sync::Arc;

use thiserror::Error;

use crate::value::{ObjectId, Value};

/// Boxed error type returned by listener callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the notification engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The listener declares an unsupported number of arguments.
    #[error(
        "invalid number of arguments for the {kind} change notification handler: {name}. \
         A maximum of 4 arguments is allowed, but {arity} were specified"
    )]
    Signature {
        kind: &'static str,
        name: Arc<str>,
        arity: usize,
    },

    /// The exception handler stack was misused.
    #[error(transparent)]
    HandlerStack(#[from] HandlerStackError),

    /// UI dispatch was requested before any UI handler was installed.
    #[error("no UI handler is installed")]
    NoUiHandler,

    /// A listener failed and the active handler record re-raised it.
    #[error("exception occurred in change notification handler for object: {object}, attribute: {name}, old value: {old}, new value: {new}")]
    Listener {
        object: ObjectId,
        name: Arc<str>,
        old: Value,
        new: Value,
        #[source]
        source: ListenerFailure,
    },
}

/// Misuse of the exception handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandlerStackError {
    #[error("attempted to pop an empty change notification exception handler stack")]
    PopLast,

    #[error("the change notification exception handler is locked; no changes are allowed")]
    Locked,
}

/// A failure raised by a listener while it was being notified.
#[derive(Debug, Error)]
pub enum ListenerFailure {
    /// The listener returned an error.
    #[error(transparent)]
    Error(BoxError),

    /// The listener panicked. Holds the panic message when it was a string.
    #[error("listener panicked: {0}")]
    Panic(String),
}

impl ListenerFailure {
    /// Build a failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Error(message.into().into())
    }

    /// Build a failure from a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::Panic(message)
    }

    /// If the failure is itself handler stack misuse, return it.
    ///
    /// Recognizes both a bare [`HandlerStackError`] and one wrapped in
    /// [`Error::HandlerStack`].
    pub fn handler_stack_error(&self) -> Option<HandlerStackError> {
        let Self::Error(err) = self else {
            return None;
        };
        if let Some(e) = err.downcast_ref::<HandlerStackError>() {
            return Some(*e);
        }
        match err.downcast_ref::<Error>() {
            Some(Error::HandlerStack(e)) => Some(*e),
            _ => None,
        }
    }

    /// Borrow the underlying listener error, if the failure was not a panic.
    pub fn as_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Error(err) => Some(err.as_ref()),
            Self::Panic(_) => None,
        }
    }
}
