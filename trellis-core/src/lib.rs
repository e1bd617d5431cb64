//! Trellis Core
//!
//! This crate provides the change-notification engine behind Trellis
//! observable attributes. It implements:
//!
//! - Listener registration with arity-adaptive argument projection
//! - Weakly bound listeners that retire themselves with their receiver
//! - Synchronous, detached-thread and UI-marshaled dispatch
//! - Per-thread exception handler stacks for listener failures
//!
//! Attribute storage, validation and coercion belong to the host; it calls
//! [`NotificationEngine::notify`] on every mutation and treats the values
//! as opaque.
//!
//! # Architecture
//!
//! - `value`: observed objects, attribute values and the change event
//! - `notify`: registrations, dispatch policies, handler stacks and the engine
//! - `config`: engine tunables
//! - `error`: error types
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use trellis_core::{Callback, NotificationEngine, ObjectHandle, Value};
//!
//! let engine = NotificationEngine::new();
//! let person = ObjectHandle::new(());
//!
//! let last = Arc::new(AtomicI64::new(0));
//! let last_clone = last.clone();
//! let on_age = Callback::arity1("on_age", move |new| {
//!     last_clone.store(new.as_value().and_then(Value::as_i64).unwrap_or(-1), Ordering::SeqCst);
//!     Ok(())
//! });
//! engine.register(&person, Some("age"), on_age.clone()).unwrap();
//!
//! engine.notify(&person, "age", 0, 5).unwrap();
//! assert_eq!(last.load(Ordering::SeqCst), 5);
//!
//! engine.unregister(&person, Some("age"), &on_age);
//! engine.notify(&person, "age", 5, 9).unwrap();
//! assert_eq!(last.load(Ordering::SeqCst), 5);
//! ```

pub mod config;
pub mod error;
pub mod notify;
pub mod value;

pub use config::EngineConfig;
pub use error::{BoxError, Error, HandlerStackError, ListenerFailure, Result};
pub use notify::{
    global, Arg, Args, Callback, DispatchMode, ExceptionHandlerStack, HandlerRecord, Lifeline, ListenerRegistration,
    ListenerResult, NotificationEngine, RegisterOptions,
};
pub use value::{ChangeEvent, ObjectHandle, ObjectId, Value};
