//! Dispatch Policies
//!
//! A registration decides *what* to call and with which arguments; its
//! [`DispatchPolicy`] decides *where* the call runs:
//!
//! - [`Synchronous`]: inline, on the thread that called `notify`.
//! - [`DetachedThread`]: on a freshly spawned thread. The spawner never
//!   waits and never sees the listener's failure; the spawned thread routes
//!   it through its own exception handler stack.
//! - [`UiMarshaled`]: inline when already on the designated UI thread,
//!   otherwise handed to the host's UI handler, which is expected to run it
//!   on the UI thread in FIFO order.
//!
//! A policy returns `Err` only for failures in its synchronous portion; the
//! calling registration routes those through the exception handler stack.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::RwLock;

use super::callback::Bound;
use super::handlers::{ExceptionHandlerStack, LOG_TARGET};
use super::projector::Args;
use crate::config::EngineConfig;
use crate::error::{Error, ListenerFailure};
use crate::value::ChangeEvent;

/// Unit of work handed to the host's UI handler.
pub type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// Host capability that queues a task for execution on the UI thread.
pub type UiHandler = Arc<dyn Fn(UiTask) + Send + Sync>;

/// Which policy a registration uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchMode {
    /// Run inline.
    #[default]
    Same,
    /// Run on a new thread.
    New,
    /// Run on the UI thread.
    Ui,
}

/// One projected call, ready to run.
pub struct Invocation {
    pub callback: Bound,
    pub args: Args,
    /// The event being delivered, for failure reporting off-thread.
    pub event: ChangeEvent,
}

impl Invocation {
    /// Run the callback on the current thread.
    pub fn run(&self, catch_panics: bool) -> Result<(), ListenerFailure> {
        if !catch_panics {
            return self.callback.call(&self.args).map_err(ListenerFailure::Error);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.callback.call(&self.args))) {
            Ok(result) => result.map_err(ListenerFailure::Error),
            Err(payload) => Err(ListenerFailure::from_panic(payload)),
        }
    }

    /// Run the callback and route any failure through this thread's
    /// handler stack. Used where there is no caller left to report to.
    fn run_detached(self, handlers: &ExceptionHandlerStack, catch_panics: bool) {
        let Err(failure) = self.run(catch_panics) else {
            return;
        };
        if let Err(err) = handlers.handle(&self.event, failure) {
            tracing::warn!(
                target: LOG_TARGET,
                thread = ?thread::current().name(),
                error = %err,
                "re-raised notification failure terminated its dispatch unit"
            );
        }
    }
}

/// State shared by every policy of one engine.
pub struct DispatchContext {
    pub(crate) handlers: Arc<ExceptionHandlerStack>,
    pub(crate) config: EngineConfig,
    ui: RwLock<Option<UiBinding>>,
    spawned: AtomicU64,
}

#[derive(Clone)]
struct UiBinding {
    thread: ThreadId,
    handler: UiHandler,
}

impl DispatchContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            handlers: Arc::new(ExceptionHandlerStack::new(config.max_handler_depth)),
            config,
            ui: RwLock::new(None),
            spawned: AtomicU64::new(0),
        }
    }

    /// Designate the calling thread as the UI thread and `handler` as the
    /// way to reach it from other threads.
    pub fn set_ui_handler(&self, handler: UiHandler) {
        *self.ui.write() = Some(UiBinding {
            thread: thread::current().id(),
            handler,
        });
    }

    pub fn clear_ui_handler(&self) {
        *self.ui.write() = None;
    }

    /// Whether the calling thread is the designated UI thread.
    pub fn is_ui_thread(&self) -> bool {
        self.ui
            .read()
            .as_ref()
            .is_some_and(|ui| ui.thread == thread::current().id())
    }

    /// Run `task` on the UI thread: inline when already there, otherwise
    /// through the UI handler.
    pub fn ui_dispatch(&self, task: UiTask) -> Result<(), Error> {
        let Some(ui) = self.ui_binding() else {
            return Err(Error::NoUiHandler);
        };
        if ui.thread == thread::current().id() {
            task();
        } else {
            (ui.handler)(task);
        }
        Ok(())
    }

    fn ui_binding(&self) -> Option<UiBinding> {
        self.ui.read().clone()
    }

    fn next_thread_name(&self) -> String {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.config.thread_name_prefix, n)
    }
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("config", &self.config)
            .field("has_ui_handler", &self.ui.read().is_some())
            .field("spawned", &self.spawned.load(Ordering::Relaxed))
            .finish()
    }
}

/// Strategy that actually runs a projected listener call.
pub trait DispatchPolicy: Send + Sync {
    /// Run `invocation`. An `Err` is a failure of the synchronous portion.
    fn dispatch(&self, invocation: Invocation) -> Result<(), ListenerFailure>;

    fn mode(&self) -> DispatchMode;
}

/// Build the policy for `mode`.
pub fn policy_for(mode: DispatchMode, context: &Arc<DispatchContext>) -> Arc<dyn DispatchPolicy> {
    let context = Arc::clone(context);
    match mode {
        DispatchMode::Same => Arc::new(Synchronous { context }),
        DispatchMode::New => Arc::new(DetachedThread { context }),
        DispatchMode::Ui => Arc::new(UiMarshaled { context }),
    }
}

/// Run inline on the calling thread.
pub struct Synchronous {
    context: Arc<DispatchContext>,
}

impl DispatchPolicy for Synchronous {
    fn dispatch(&self, invocation: Invocation) -> Result<(), ListenerFailure> {
        invocation.run(self.context.config.catch_panics)
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Same
    }
}

/// Run on a freshly spawned, detached thread.
pub struct DetachedThread {
    context: Arc<DispatchContext>,
}

impl DispatchPolicy for DetachedThread {
    fn dispatch(&self, invocation: Invocation) -> Result<(), ListenerFailure> {
        let context = Arc::clone(&self.context);
        let spawned = thread::Builder::new()
            .name(self.context.next_thread_name())
            .spawn(move || {
                // Nobody joins this thread, so panics are always caught here.
                invocation.run_detached(&context.handlers, true);
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(err) => Err(ListenerFailure::Error(Box::new(err))),
        }
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::New
    }
}

/// Run on the designated UI thread.
pub struct UiMarshaled {
    context: Arc<DispatchContext>,
}

impl DispatchPolicy for UiMarshaled {
    fn dispatch(&self, invocation: Invocation) -> Result<(), ListenerFailure> {
        let Some(ui) = self.context.ui_binding() else {
            tracing::warn!(target: LOG_TARGET, "UI dispatch requested but no UI handler is installed");
            return Err(ListenerFailure::Error(Box::new(Error::NoUiHandler)));
        };

        if ui.thread == thread::current().id() {
            return invocation.run(self.context.config.catch_panics);
        }

        let context = Arc::clone(&self.context);
        (ui.handler)(Box::new(move || {
            invocation.run_detached(&context.handlers, true);
        }));
        Ok(())
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Ui
    }
}
