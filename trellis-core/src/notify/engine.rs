//! Notification Engine
//!
//! The façade an attribute store talks to. It keeps, per observed object,
//! one ordered [`ListenerSet`] per attribute name plus one set of
//! any-attribute listeners, and delivers every change to them.
//!
//! # Delivery
//!
//! `notify(object, name, old, new)` visits the attribute's listeners in
//! registration order, then the object's any-attribute listeners in
//! registration order. A failing listener is handled by the calling thread's
//! exception handler stack and does not stop the ones after it, unless the
//! active handler record re-raises, in which case `notify` returns that
//! error immediately.
//!
//! # Thread Safety
//!
//! The registry is a `DashMap` keyed by object, each entry holding
//! copy-on-write listener sets. Registering, unregistering, weak-reference
//! cleanup and delivery may all run concurrently; a delivery sees the sets
//! as they were when it reached them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;

use super::callback::Callback;
use super::dispatch::{policy_for, DispatchContext, UiHandler, UiTask};
use super::handlers::{ExceptionHandlerStack, LOG_TARGET};
use super::projector::Projection;
use super::registration::{ListenerRegistration, ListenerSet, RegisterOptions};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::value::{ChangeEvent, ObjectHandle, ObjectId, Value};

/// Listeners attached to one observed object.
#[derive(Default)]
struct ObjectListeners {
    attributes: RwLock<HashMap<Arc<str>, Arc<ListenerSet>>>,
    any: Arc<ListenerSet>,
}

impl ObjectListeners {
    fn attribute(&self, name: &str) -> Option<Arc<ListenerSet>> {
        self.attributes.read().get(name).cloned()
    }

    fn attribute_or_insert(&self, name: &str) -> Arc<ListenerSet> {
        if let Some(set) = self.attribute(name) {
            return set;
        }
        Arc::clone(
            self.attributes
                .write()
                .entry(Arc::from(name))
                .or_insert_with(ListenerSet::new),
        )
    }

    fn set_for(&self, name: Option<&str>) -> Option<Arc<ListenerSet>> {
        match name {
            Some(name) => self.attribute(name),
            None => Some(Arc::clone(&self.any)),
        }
    }

    fn all_sets(&self) -> Vec<Arc<ListenerSet>> {
        let mut sets: Vec<_> = self.attributes.read().values().cloned().collect();
        sets.push(Arc::clone(&self.any));
        sets
    }
}

/// Dispatches attribute changes to registered listeners.
pub struct NotificationEngine {
    context: Arc<DispatchContext>,
    objects: DashMap<ObjectId, Arc<ObjectListeners>>,
}

impl NotificationEngine {
    /// Create an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            context: Arc::new(DispatchContext::new(config)),
            objects: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    /// This engine's per-thread exception handler stacks.
    pub fn handlers(&self) -> &ExceptionHandlerStack {
        &self.context.handlers
    }

    /// Register a synchronous listener.
    ///
    /// `name = None` registers an any-attribute listener.
    pub fn register(
        &self,
        object: &ObjectHandle,
        name: Option<&str>,
        callback: Callback,
    ) -> Result<Arc<ListenerRegistration>> {
        self.register_with(object, name, callback, RegisterOptions::default())
    }

    /// Register a listener with explicit options.
    pub fn register_with(
        &self,
        object: &ObjectHandle,
        name: Option<&str>,
        callback: Callback,
        options: RegisterOptions,
    ) -> Result<Arc<ListenerRegistration>> {
        let projection = match name {
            Some(_) => Projection::PerAttribute,
            None => Projection::AnyAttribute,
        };
        self.insert(object, name, callback, projection, options, true)
    }

    /// Register a statically declared listener.
    ///
    /// Static listeners use the static projection table for named
    /// attributes and cannot be unregistered by callback; they go away with
    /// [`dispose_object`](Self::dispose_object).
    pub fn register_static(
        &self,
        object: &ObjectHandle,
        name: Option<&str>,
        callback: Callback,
    ) -> Result<Arc<ListenerRegistration>> {
        let projection = match name {
            Some(_) => Projection::StaticAttribute,
            None => Projection::AnyAttribute,
        };
        self.insert(object, name, callback, projection, RegisterOptions::default(), false)
    }

    fn insert(
        &self,
        object: &ObjectHandle,
        name: Option<&str>,
        callback: Callback,
        projection: Projection,
        options: RegisterOptions,
        matchable: bool,
    ) -> Result<Arc<ListenerRegistration>> {
        let policy = policy_for(options.dispatch, &self.context);
        // Validate before touching the registry.
        let registration = ListenerRegistration::new(callback, projection, policy, options, matchable)?;

        {
            // Holding the entry keeps a concurrent `dispose_object` from
            // taking the listeners out between lookup and push.
            let listeners = self.objects.entry(object.id()).or_default();
            let set = match name {
                Some(name) => listeners.attribute_or_insert(name),
                None => Arc::clone(&listeners.any),
            };
            set.push(Arc::clone(&registration));
        }

        tracing::trace!(
            target: LOG_TARGET,
            object = %object.id(),
            attribute = name.unwrap_or("*"),
            listener = %registration.callback().name(),
            "listener registered"
        );
        Ok(registration)
    }

    /// Remove the first registration matching `callback`.
    ///
    /// Returns whether anything was removed.
    pub fn unregister(&self, object: &ObjectHandle, name: Option<&str>, callback: &Callback) -> bool {
        let Some(set) = self.object_listeners(object.id()).and_then(|l| l.set_for(name)) else {
            return false;
        };
        let removed = set.remove_matching(callback).is_some();
        if removed {
            tracing::trace!(
                target: LOG_TARGET,
                object = %object.id(),
                attribute = name.unwrap_or("*"),
                listener = %callback.name(),
                "listener unregistered"
            );
        }
        removed
    }

    /// Remove exactly `registration`, wherever it lives.
    pub fn remove(&self, registration: &Arc<ListenerRegistration>) -> bool {
        let removed = registration
            .owner()
            .is_some_and(|set| set.remove(registration));
        registration.dispose();
        removed
    }

    /// Deliver a change to every listener of `name` on `object`, then to the
    /// object's any-attribute listeners.
    pub fn notify(
        &self,
        object: &ObjectHandle,
        name: &str,
        old: impl Into<Value>,
        new: impl Into<Value>,
    ) -> Result<()> {
        let Some(listeners) = self.object_listeners(object.id()) else {
            return Ok(());
        };
        let event = ChangeEvent::new(object, name, old.into(), new.into());

        if let Some(set) = listeners.attribute(name) {
            for registration in set.snapshot().iter() {
                registration.notify(&event, &self.context.handlers)?;
            }
        }
        for registration in listeners.any.snapshot().iter() {
            registration.notify(&event, &self.context.handlers)?;
        }
        Ok(())
    }

    /// Drop and dispose every registration for `object`.
    ///
    /// The attribute store calls this when the object is destroyed.
    pub fn dispose_object(&self, object: &ObjectHandle) -> usize {
        let Some((_, listeners)) = self.objects.remove(&object.id()) else {
            return 0;
        };
        let disposed: usize = listeners.all_sets().iter().map(|set| set.clear()).sum();
        tracing::debug!(target: LOG_TARGET, object = %object.id(), disposed, "object listeners disposed");
        disposed
    }

    /// Remove every registration whose weakly bound receiver or target is
    /// gone, returning how many were removed.
    pub fn purge(&self) -> usize {
        let sets: Vec<_> = self
            .objects
            .iter()
            .flat_map(|entry| entry.value().all_sets())
            .collect();
        sets.iter().map(|set| set.purge()).sum()
    }

    /// Number of registrations for `name` on `object` (any-attribute ones
    /// when `name` is `None`).
    pub fn listener_count(&self, object: &ObjectHandle, name: Option<&str>) -> usize {
        self.object_listeners(object.id())
            .and_then(|l| l.set_for(name))
            .map_or(0, |set| set.len())
    }

    /// Make the calling thread the UI thread, reachable through `handler`.
    pub fn set_ui_handler<F>(&self, handler: F)
    where
        F: Fn(UiTask) + Send + Sync + 'static,
    {
        let handler: UiHandler = Arc::new(handler);
        self.context.set_ui_handler(handler);
    }

    pub fn clear_ui_handler(&self) {
        self.context.clear_ui_handler();
    }

    pub fn is_ui_thread(&self) -> bool {
        self.context.is_ui_thread()
    }

    /// Run `f` on the UI thread: inline when called from it, otherwise
    /// through the installed UI handler.
    pub fn ui_dispatch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.context.ui_dispatch(Box::new(f))
    }

    fn object_listeners(&self, id: ObjectId) -> Option<Arc<ObjectListeners>> {
        self.objects.get(&id).map(|entry| Arc::clone(entry.value()))
    }

}

impl Default for NotificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotificationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationEngine")
            .field("context", &self.context)
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// The process-wide engine, created on first use.
pub fn global() -> &'static NotificationEngine {
    static ENGINE: OnceLock<NotificationEngine> = OnceLock::new();
    ENGINE.get_or_init(NotificationEngine::new)
}
