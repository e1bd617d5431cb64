//! Change Notification
//!
//! This module implements the dispatch side of observable attributes: an
//! attribute store calls [`NotificationEngine::notify`] whenever a value
//! changes, and the engine delivers the change to every registered listener.
//!
//! # Concepts
//!
//! ## Listeners
//!
//! A listener is a [`Callback`] declaring 0 to 4 positional arguments. The
//! engine projects the canonical (object, name, old, new) tuple down to
//! what the listener asked for; see [`projector`] for the tables.
//!
//! ## Weak binding
//!
//! A method callback, or a function registered with an explicit target,
//! does not keep its receiver alive. Once the receiver is gone the
//! registration disposes itself and leaves its collection.
//!
//! ## Dispatch policies
//!
//! Each registration runs its listener inline, on a new thread, or on the
//! UI thread, depending on its [`DispatchMode`].
//!
//! ## Failure handling
//!
//! Listener failures, returned errors and caught panics alike, go to the
//! calling thread's [`ExceptionHandlerStack`]. By default they are logged
//! and swallowed; a record pushed with `reraise` makes them propagate out
//! of `notify`.
//!
//! # Implementation Notes
//!
//! Handler stacks live in thread-local storage, like the tracking context of
//! a reactive runtime: each thread owns and mutates only its own stack.
//! Listener collections are shared and copy-on-write.

mod callback;
mod dispatch;
mod engine;
mod handlers;
pub mod projector;
mod registration;

pub use callback::{Bound, Callback, ListenerResult};
pub use dispatch::{
    DetachedThread, DispatchContext, DispatchMode, DispatchPolicy, Invocation, Synchronous, UiHandler,
    UiMarshaled, UiTask,
};
pub use engine::{global, NotificationEngine};
pub use handlers::{ExceptionHandlerStack, HandlerFn, HandlerRecord, LOG_TARGET};
pub use projector::{Arg, Args, Projection, MAX_ARITY};
pub use registration::{Lifeline, ListenerId, ListenerRegistration, ListenerSet, RegisterOptions};
