//! Listener Registrations
//!
//! A [`ListenerRegistration`] binds a [`Callback`] to its projection table
//! and dispatch policy, and lives in exactly one [`ListenerSet`].
//!
//! # Lifecycle
//!
//! A registration starts `Active` and ends `Disposed`; there is no way back.
//! It becomes disposed when:
//!
//! - it is unregistered or its object is torn down,
//! - [`ListenerRegistration::dispose`] is called,
//! - the receiver (or explicit target) it is weakly bound to disappears.
//!
//! In the last case the registration also removes itself from its set. The
//! loss is noticed either lazily, the next time the registration is
//! notified, or eagerly, when a [`Lifeline`] owned by the receiver drops.
//! Removal may race with an explicit unregister; whichever runs second
//! finds nothing to do.
//!
//! # Snapshots
//!
//! A [`ListenerSet`] is copy-on-write. `notify` takes a snapshot and iterates
//! it without holding any lock, so concurrent register/unregister never
//! disturbs a delivery in progress. A registration removed mid-delivery is
//! already disposed and is skipped.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::callback::Callback;
use super::dispatch::{DispatchMode, DispatchPolicy, Invocation};
use super::handlers::{ExceptionHandlerStack, LOG_TARGET};
use super::projector::{Projection, MAX_ARITY};
use crate::error::{Error, Result};
use crate::value::ChangeEvent;

/// Unique identifier for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for a dynamic registration.
#[derive(Clone, Default)]
pub struct RegisterOptions {
    pub(crate) dispatch: DispatchMode,
    pub(crate) target: Option<Weak<dyn Any + Send + Sync>>,
    pub(crate) extended: bool,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the listener runs.
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Retire the listener when `target` is dropped.
    pub fn target<T>(mut self, target: &Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        self.target = Some(weak);
        self
    }

    /// Also deliver changes whose old value is uninitialized.
    pub fn extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }
}

impl fmt::Debug for RegisterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterOptions")
            .field("dispatch", &self.dispatch)
            .field("has_target", &self.target.is_some())
            .field("extended", &self.extended)
            .finish()
    }
}

/// A registered listener.
pub struct ListenerRegistration {
    id: ListenerId,
    callback: Callback,
    projection: Projection,
    policy: Arc<dyn DispatchPolicy>,
    target: Option<Weak<dyn Any + Send + Sync>>,
    /// Extended listeners still see changes from the uninitialized sentinel.
    extended: bool,
    /// Static listeners never match an unregister request.
    matchable: bool,
    disposed: AtomicBool,
    owner: Mutex<Option<Weak<ListenerSet>>>,
}

impl ListenerRegistration {
    /// Validate the callback's arity and build an unowned registration.
    pub(crate) fn new(
        callback: Callback,
        projection: Projection,
        policy: Arc<dyn DispatchPolicy>,
        options: RegisterOptions,
        matchable: bool,
    ) -> Result<Arc<Self>> {
        if callback.arity() > MAX_ARITY {
            return Err(Error::Signature {
                kind: projection.kind(),
                name: callback.name().clone(),
                arity: callback.arity(),
            });
        }

        Ok(Arc::new(Self {
            id: ListenerId::new(),
            callback,
            projection,
            policy,
            target: options.target,
            extended: options.extended,
            matchable,
            disposed: AtomicBool::new(false),
            owner: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.policy.mode()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the registration would still deliver: not disposed, and its
    /// weakly bound receiver or target is alive.
    pub fn is_alive(&self) -> bool {
        !self.is_disposed() && !self.bound_object_gone()
    }

    /// Deliver one change.
    ///
    /// Returns an error only when a listener failure is re-raised by the
    /// current thread's handler record.
    pub fn notify(&self, event: &ChangeEvent, handlers: &ExceptionHandlerStack) -> Result<()> {
        if self.is_disposed() || (!self.extended && event.old.is_uninitialized()) {
            return Ok(());
        }
        if self.bound_object_gone() {
            self.receiver_collected();
            return Ok(());
        }
        let Some(callback) = self.callback.bind() else {
            self.receiver_collected();
            return Ok(());
        };

        let invocation = Invocation {
            callback,
            args: self.projection.project(event, self.callback.arity()),
            event: event.clone(),
        };
        match self.policy.dispatch(invocation) {
            Ok(()) => Ok(()),
            Err(failure) => handlers.handle(event, failure),
        }
    }

    /// Stop delivering. Idempotent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// The weakly bound receiver or target is gone: dispose and leave the
    /// owning set. Safe to call from any thread, any number of times.
    pub fn receiver_collected(&self) {
        self.dispose();
        let owner = self.owner.lock().take();
        let Some(set) = owner.and_then(|w| w.upgrade()) else {
            return;
        };
        if set.remove_id(self.id) {
            tracing::debug!(
                target: LOG_TARGET,
                listener = %self.callback.name(),
                "weakly bound listener collected"
            );
        }
    }

    /// Whether this registration answers an unregister request for `callback`.
    pub fn matches(&self, callback: &Callback) -> bool {
        self.matchable && self.callback.same_listener(callback)
    }

    fn bound_object_gone(&self) -> bool {
        let receiver_gone = self
            .callback
            .receiver()
            .is_some_and(|r| r.strong_count() == 0);
        let target_gone = self.target.as_ref().is_some_and(|t| t.strong_count() == 0);
        receiver_gone || target_gone
    }

    /// The set this registration was last pushed into, if it still exists.
    pub(crate) fn owner(&self) -> Option<Arc<ListenerSet>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    fn set_owner(&self, owner: &Arc<ListenerSet>) {
        *self.owner.lock() = Some(Arc::downgrade(owner));
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("callback", &self.callback)
            .field("projection", &self.projection)
            .field("dispatch", &self.dispatch_mode())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

type Entries = Arc<Vec<Arc<ListenerRegistration>>>;

/// Ordered, copy-on-write collection of registrations.
#[derive(Default)]
pub struct ListenerSet {
    entries: RwLock<Entries>,
}

impl ListenerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The registrations present right now, in registration order.
    pub fn snapshot(&self) -> Entries {
        Arc::clone(&self.entries.read())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `registration` and make this set its owner.
    pub fn push(self: &Arc<Self>, registration: Arc<ListenerRegistration>) {
        registration.set_owner(self);
        Arc::make_mut(&mut *self.entries.write()).push(registration);
    }

    /// Remove and dispose the first registration answering to `callback`.
    pub fn remove_matching(&self, callback: &Callback) -> Option<Arc<ListenerRegistration>> {
        let removed = {
            let mut entries = self.entries.write();
            let index = entries.iter().position(|r| r.matches(callback))?;
            Arc::make_mut(&mut *entries).remove(index)
        };
        removed.dispose();
        Some(removed)
    }

    /// Remove and dispose exactly `registration`.
    pub fn remove(&self, registration: &Arc<ListenerRegistration>) -> bool {
        registration.dispose();
        self.remove_id(registration.id)
    }

    /// Remove every dead registration, returning how many went.
    pub fn purge(&self) -> usize {
        let dead: Vec<_> = {
            let mut entries = self.entries.write();
            if entries.iter().all(|r| r.is_alive()) {
                return 0;
            }
            let (alive, dead): (Vec<_>, Vec<_>) = entries.iter().cloned().partition(|r| r.is_alive());
            *entries = Arc::new(alive);
            dead
        };
        // Dropped outside the lock: a registration may own user state
        // whose destructor touches this set again.
        for registration in &dead {
            registration.dispose();
        }
        dead.len()
    }

    /// Remove and dispose everything.
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.entries.write());
        for registration in drained.iter() {
            registration.dispose();
        }
        drained.len()
    }

    fn remove_id(&self, id: ListenerId) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let Some(index) = entries.iter().position(|r| r.id == id) else {
                return false;
            };
            Arc::make_mut(&mut *entries).remove(index)
        };
        drop(removed);
        true
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}

/// Drop-notifier a receiver can own to retire its registrations eagerly.
///
/// ```rust
/// use std::sync::Arc;
/// use trellis_core::{Callback, Lifeline, NotificationEngine, ObjectHandle};
///
/// struct View {
///     lifeline: Lifeline,
/// }
///
/// let engine = NotificationEngine::new();
/// let model = ObjectHandle::new(());
/// let view = Arc::new(View { lifeline: Lifeline::new() });
///
/// let cb = Callback::method(&view, "refresh", 0, |_: &View, _| Ok(()));
/// let registration = engine.register(&model, Some("x"), cb).unwrap();
/// view.lifeline.watch(&registration);
///
/// drop(view);
/// assert_eq!(engine.listener_count(&model, Some("x")), 0);
/// ```
#[derive(Default)]
pub struct Lifeline {
    watchers: Mutex<Vec<Weak<ListenerRegistration>>>,
}

impl Lifeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire `registration` when this lifeline drops.
    pub fn watch(&self, registration: &Arc<ListenerRegistration>) {
        self.watchers.lock().push(Arc::downgrade(registration));
    }
}

impl Drop for Lifeline {
    fn drop(&mut self) {
        for watcher in self.watchers.get_mut().drain(..) {
            if let Some(registration) = watcher.upgrade() {
                registration.receiver_collected();
            }
        }
    }
}

impl fmt::Debug for Lifeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifeline")
            .field("watchers", &self.watchers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::notify::dispatch::{policy_for, DispatchContext};
    use crate::value::{ObjectHandle, Value};
    use std::sync::atomic::AtomicUsize;

    fn sync_policy() -> (Arc<DispatchContext>, Arc<dyn DispatchPolicy>) {
        let ctx = Arc::new(DispatchContext::new(EngineConfig::default()));
        let policy = policy_for(DispatchMode::Same, &ctx);
        (ctx, policy)
    }

    fn counting(name: &str, count: &Arc<AtomicUsize>) -> Callback {
        let count = count.clone();
        Callback::arity0(name, move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn event(old: Value) -> ChangeEvent {
        ChangeEvent::new(&ObjectHandle::new(()), "x", old, Value::from(1))
    }

    #[test]
    fn rejects_arity_above_four() {
        let (_, policy) = sync_policy();
        let cb = Callback::function("too_many", 5, |_| Ok(()));
        let err = ListenerRegistration::new(cb, Projection::PerAttribute, policy, RegisterOptions::new(), true)
            .unwrap_err();
        assert!(matches!(err, Error::Signature { arity: 5, .. }));
    }

    #[test]
    fn skips_uninitialized_unless_extended() {
        let (ctx, policy) = sync_policy();
        let count = Arc::new(AtomicUsize::new(0));

        let plain = ListenerRegistration::new(
            counting("f", &count),
            Projection::PerAttribute,
            policy.clone(),
            RegisterOptions::new(),
            true,
        )
        .unwrap();
        plain.notify(&event(Value::Uninitialized), &ctx.handlers).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let extended = ListenerRegistration::new(
            counting("g", &count),
            Projection::PerAttribute,
            policy,
            RegisterOptions::new().extended(true),
            true,
        )
        .unwrap();
        extended.notify(&event(Value::Uninitialized), &ctx.handlers).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disposed_registration_is_silent() {
        let (ctx, policy) = sync_policy();
        let count = Arc::new(AtomicUsize::new(0));
        let reg = ListenerRegistration::new(
            counting("f", &count),
            Projection::PerAttribute,
            policy,
            RegisterOptions::new(),
            true,
        )
        .unwrap();

        reg.notify(&event(Value::from(0)), &ctx.handlers).unwrap();
        reg.dispose();
        reg.dispose();
        reg.notify(&event(Value::from(0)), &ctx.handlers).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!reg.is_alive());
    }

    #[test]
    fn dead_receiver_removes_registration_from_set() {
        struct Receiver;
        let (ctx, policy) = sync_policy();
        let receiver = Arc::new(Receiver);
        let cb = Callback::method(&receiver, "on_x", 0, |_: &Receiver, _| Ok(()));
        let reg = ListenerRegistration::new(cb, Projection::PerAttribute, policy, RegisterOptions::new(), true)
            .unwrap();
        let set = ListenerSet::new();
        set.push(reg.clone());
        assert_eq!(set.len(), 1);

        drop(receiver);
        assert!(!reg.is_alive());
        reg.notify(&event(Value::from(0)), &ctx.handlers).unwrap();
        assert!(set.is_empty());
        assert!(reg.is_disposed());

        // Collecting twice, or after an explicit removal, is harmless.
        reg.receiver_collected();
        assert!(!set.remove(&reg));
    }

    #[test]
    fn dead_target_retires_function_listener() {
        let (ctx, policy) = sync_policy();
        let count = Arc::new(AtomicUsize::new(0));
        let target = Arc::new(String::from("owner"));
        let reg = ListenerRegistration::new(
            counting("f", &count),
            Projection::PerAttribute,
            policy,
            RegisterOptions::new().target(&target),
            true,
        )
        .unwrap();

        reg.notify(&event(Value::from(0)), &ctx.handlers).unwrap();
        drop(target);
        reg.notify(&event(Value::from(0)), &ctx.handlers).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(reg.is_disposed());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_removal() {
        let (_, policy) = sync_policy();
        let count = Arc::new(AtomicUsize::new(0));
        let cb = counting("f", &count);
        let reg = ListenerRegistration::new(cb.clone(), Projection::PerAttribute, policy, RegisterOptions::new(), true)
            .unwrap();
        let set = ListenerSet::new();
        set.push(reg);

        let snapshot = set.snapshot();
        let removed = set.remove_matching(&cb).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(set.is_empty());
        assert!(removed.is_disposed());
        assert!(snapshot[0].is_disposed());
    }

    #[test]
    fn static_registrations_never_match() {
        let (_, policy) = sync_policy();
        let count = Arc::new(AtomicUsize::new(0));
        let cb = counting("f", &count);
        let reg = ListenerRegistration::new(cb.clone(), Projection::StaticAttribute, policy, RegisterOptions::new(), false)
            .unwrap();
        assert!(!reg.matches(&cb));
    }

    #[test]
    fn purged_entries_are_dropped_outside_the_lock() {
        let (_, policy) = sync_policy();
        let count = Arc::new(AtomicUsize::new(0));
        let set = ListenerSet::new();

        let watched = ListenerRegistration::new(
            counting("watched", &count),
            Projection::PerAttribute,
            policy.clone(),
            RegisterOptions::new(),
            true,
        )
        .unwrap();
        set.push(watched.clone());

        // The only owner of this lifeline is a listener the purge removes.
        let lifeline = Lifeline::new();
        lifeline.watch(&watched);
        let target = Arc::new(());
        let owner = Callback::arity0("owner", move || {
            let _ = &lifeline;
            Ok(())
        });
        set.push(
            ListenerRegistration::new(owner, Projection::PerAttribute, policy, RegisterOptions::new().target(&target), true)
                .unwrap(),
        );

        drop(target);
        assert_eq!(set.purge(), 1);
        assert!(set.is_empty());
        assert!(watched.is_disposed());
    }

    #[test]
    fn lifeline_retires_watched_registrations() {
        struct View {
            lifeline: Lifeline,
        }
        let (_, policy) = sync_policy();
        let view = Arc::new(View { lifeline: Lifeline::new() });
        let cb = Callback::method(&view, "refresh", 0, |_: &View, _| Ok(()));
        let reg = ListenerRegistration::new(cb, Projection::AnyAttribute, policy, RegisterOptions::new(), true)
            .unwrap();
        let set = ListenerSet::new();
        set.push(reg.clone());
        view.lifeline.watch(&reg);

        drop(view);
        assert!(set.is_empty());
        assert!(reg.is_disposed());
    }

    #[test]
    fn purge_drops_only_dead_entries() {
        struct Receiver;
        let (_, policy) = sync_policy();
        let count = Arc::new(AtomicUsize::new(0));
        let receiver = Arc::new(Receiver);
        let set = ListenerSet::new();
        for cb in [
            counting("live", &count),
            Callback::method(&receiver, "on_x", 0, |_: &Receiver, _| Ok(())),
        ] {
            set.push(
                ListenerRegistration::new(cb, Projection::PerAttribute, policy.clone(), RegisterOptions::new(), true)
                    .unwrap(),
            );
        }

        assert_eq!(set.purge(), 0);
        drop(receiver);
        assert_eq!(set.purge(), 1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.clear(), 1);
        assert!(set.is_empty());
    }
}
