//! Exception Handler Stack
//!
//! Decides what happens when a listener fails. Every thread has its own
//! stack of [`HandlerRecord`]s; the top record is consulted for every
//! failure raised on that thread.
//!
//! # Initialization
//!
//! A thread's stack is created lazily on first use, holding exactly one
//! record: the top record of the designated main thread if one was pushed
//! with [`ExceptionHandlerStack::push_main`], otherwise the built-in
//! logging handler. The bottom record can never be popped.
//!
//! # Isolation
//!
//! Stacks live in thread-local storage keyed by the owning
//! [`ExceptionHandlerStack`], so two engines never see each other's
//! records, and a thread only ever mutates its own stack. The main thread's
//! stack is additionally readable by threads that are initializing.
//!
//! Dropping an `ExceptionHandlerStack` releases the dropping thread's stack
//! at once. Other threads release theirs the next time they initialize a
//! stack, or when they exit.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::Level;

use crate::error::{Error, HandlerStackError, ListenerFailure};
use crate::value::ChangeEvent;

/// Log target used by the default handler.
pub const LOG_TARGET: &str = "trellis::notify";

/// A user supplied exception handler.
pub type HandlerFn = dyn Fn(&ChangeEvent, &ListenerFailure) + Send + Sync;

type SharedStack = Arc<Mutex<Vec<HandlerRecord>>>;

/// One thread's records for one `ExceptionHandlerStack`.
struct ThreadStack {
    /// Dead once the owning `ExceptionHandlerStack` is dropped.
    owner: Weak<()>,
    records: SharedStack,
}

thread_local! {
    /// This thread's stacks, one per `ExceptionHandlerStack` it has used.
    static STACKS: RefCell<HashMap<u64, ThreadStack>> = RefCell::new(HashMap::new());

    /// Re-entrancy depth of the default logging handler on this thread.
    static LOG_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// One entry of the handler stack.
#[derive(Clone)]
pub struct HandlerRecord {
    /// `None` means the built-in logging handler.
    handler: Option<Arc<HandlerFn>>,
    reraise: bool,
    locked: bool,
}

impl HandlerRecord {
    /// A record using the built-in logging handler.
    pub fn logging() -> Self {
        Self {
            handler: None,
            reraise: false,
            locked: false,
        }
    }

    /// A record using a custom handler.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ChangeEvent, &ListenerFailure) + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
            reraise: false,
            locked: false,
        }
    }

    /// Re-raise failures after the handler has run.
    pub fn reraise(mut self, reraise: bool) -> Self {
        self.reraise = reraise;
        self
    }

    /// Forbid any further push or pop while this record is on top.
    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn is_logging(&self) -> bool {
        self.handler.is_none()
    }

    pub fn reraises(&self) -> bool {
        self.reraise
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Default for HandlerRecord {
    fn default() -> Self {
        Self::logging()
    }
}

impl fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("logging", &self.is_logging())
            .field("reraise", &self.reraise)
            .field("locked", &self.locked)
            .finish()
    }
}

/// Per-thread stacks of exception handler records.
pub struct ExceptionHandlerStack {
    id: u64,
    alive: Arc<()>,
    /// Stack of the thread designated as main, if any.
    main: Mutex<Option<SharedStack>>,
    max_log_depth: usize,
}

impl ExceptionHandlerStack {
    pub fn new(max_log_depth: usize) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            main: Mutex::new(None),
            max_log_depth: max_log_depth.max(1),
        }
    }

    /// Push a record, returning the record that was on top before.
    ///
    /// Fails if the current top record is locked.
    pub fn push(&self, record: HandlerRecord) -> Result<HandlerRecord, HandlerStackError> {
        let stack = self.current();
        let mut records = stack.lock();
        let previous = top_of(&records);
        if previous.locked {
            return Err(HandlerStackError::Locked);
        }
        records.push(record);
        Ok(previous)
    }

    /// Push a record and make this thread's stack the basis for threads
    /// that have not initialized their own yet.
    pub fn push_main(&self, record: HandlerRecord) -> Result<HandlerRecord, HandlerStackError> {
        let previous = self.push(record)?;
        let stack = self.current();
        *self.main.lock() = Some(stack);
        Ok(previous)
    }

    /// Pop the top record.
    ///
    /// Fails if the top record is locked or is the last one left.
    pub fn pop(&self) -> Result<(), HandlerStackError> {
        let stack = self.current();
        let mut records = stack.lock();
        if top_of(&records).locked {
            return Err(HandlerStackError::Locked);
        }
        if records.len() <= 1 {
            return Err(HandlerStackError::PopLast);
        }
        records.pop();
        Ok(())
    }

    /// Number of records on this thread's stack. Always at least one.
    pub fn depth(&self) -> usize {
        self.current().lock().len()
    }

    /// Copy of this thread's top record.
    pub fn top(&self) -> HandlerRecord {
        top_of(&self.current().lock())
    }

    /// Handle a listener failure with this thread's top record.
    ///
    /// Returns an error when the failure must keep propagating: the record
    /// asks for re-raising, or the failure was itself handler stack misuse.
    pub fn handle(&self, event: &ChangeEvent, failure: ListenerFailure) -> Result<(), Error> {
        let record = self.top();
        match &record.handler {
            Some(handler) => handler(event, &failure),
            None => {
                self.log_failure(event, &failure);
            }
        }

        if let Some(err) = failure.handler_stack_error() {
            return Err(Error::HandlerStack(err));
        }
        if record.reraise {
            return Err(Error::Listener {
                object: event.object.id(),
                name: event.name.clone(),
                old: event.old.clone(),
                new: event.new.clone(),
                source: failure,
            });
        }
        Ok(())
    }

    /// The built-in handler: log through `tracing`, falling back to stderr
    /// when nothing would record the event or the handler keeps re-entering.
    ///
    /// The stack trace is captured as configured by `RUST_BACKTRACE` and
    /// `RUST_LIB_BACKTRACE`.
    fn log_failure(&self, event: &ChangeEvent, failure: &ListenerFailure) -> LogSink {
        let _depth = LogDepth::enter();
        let backtrace = Backtrace::capture();

        if LogDepth::current() > self.max_log_depth || !tracing::enabled!(target: LOG_TARGET, Level::ERROR) {
            eprintln!("{}", failure_report(event, failure, &backtrace));
            return LogSink::Stderr;
        }

        tracing::error!(
            target: LOG_TARGET,
            object = %event.object.id(),
            attribute = %event.name,
            old = %event.old,
            new = %event.new,
            error = %failure,
            backtrace = captured(&backtrace).map(tracing::field::display),
            "exception occurred in change notification handler"
        );
        LogSink::Tracing
    }

    /// This thread's stack, initializing it if needed.
    fn current(&self) -> SharedStack {
        let existing = STACKS.with(|stacks| stacks.borrow().get(&self.id).map(|s| Arc::clone(&s.records)));
        if let Some(stack) = existing {
            return stack;
        }

        let basis = match self.main.lock().as_ref() {
            Some(main) => top_of(&main.lock()),
            None => HandlerRecord::logging(),
        };
        let stack = Arc::new(Mutex::new(vec![basis]));
        let stale = STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let dead: Vec<u64> = stacks
                .iter()
                .filter(|(_, s)| s.owner.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect();
            let stale: Vec<ThreadStack> = dead.iter().filter_map(|id| stacks.remove(id)).collect();
            stacks.insert(
                self.id,
                ThreadStack {
                    owner: Arc::downgrade(&self.alive),
                    records: Arc::clone(&stack),
                },
            );
            stale
        });
        // Records hold user handlers; drop them with STACKS released.
        drop(stale);
        stack
    }
}

impl Default for ExceptionHandlerStack {
    fn default() -> Self {
        Self::new(crate::EngineConfig::default().max_handler_depth)
    }
}

impl Drop for ExceptionHandlerStack {
    fn drop(&mut self) {
        let removed = STACKS.try_with(|stacks| stacks.borrow_mut().remove(&self.id));
        drop(removed);
    }
}

impl fmt::Debug for ExceptionHandlerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandlerStack")
            .field("id", &self.id)
            .field("has_main", &self.main.lock().is_some())
            .finish()
    }
}

fn top_of(records: &[HandlerRecord]) -> HandlerRecord {
    records.last().cloned().unwrap_or_default()
}

/// Where the default handler sent a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogSink {
    Tracing,
    Stderr,
}

fn captured(backtrace: &Backtrace) -> Option<&Backtrace> {
    (backtrace.status() == BacktraceStatus::Captured).then_some(backtrace)
}

/// Plain-text report used when logging falls back to stderr.
fn failure_report(event: &ChangeEvent, failure: &ListenerFailure, backtrace: &Backtrace) -> String {
    let mut report = format!(
        "Exception occurred in change notification handler for object: {}, attribute: {}, \
         old value: {}, new value: {}.\n{}",
        event.object.id(),
        event.name,
        event.old,
        event.new,
        failure,
    );
    if let Some(backtrace) = captured(backtrace) {
        report.push_str("\nstack backtrace:\n");
        report.push_str(&backtrace.to_string());
    }
    report
}

/// Guard tracking re-entrancy of the logging handler.
struct LogDepth;

impl LogDepth {
    fn enter() -> Self {
        LOG_DEPTH.with(|d| d.set(d.get() + 1));
        LogDepth
    }

    fn current() -> usize {
        LOG_DEPTH.with(Cell::get)
    }
}

impl Drop for LogDepth {
    fn drop(&mut self) {
        LOG_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ObjectHandle, Value};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn event() -> ChangeEvent {
        ChangeEvent::new(&ObjectHandle::new(()), "x", Value::from(0), Value::from(5))
    }

    #[test]
    fn fresh_thread_has_single_logging_record() {
        let stack = ExceptionHandlerStack::default();
        assert_eq!(stack.depth(), 1);
        assert!(stack.top().is_logging());
    }

    #[test]
    fn push_push_pop_pop_restores_default() {
        let stack = ExceptionHandlerStack::default();
        stack.push(HandlerRecord::new(|_, _| {})).unwrap();
        stack.push(HandlerRecord::logging().reraise(true)).unwrap();
        assert_eq!(stack.depth(), 3);

        stack.pop().unwrap();
        stack.pop().unwrap();
        assert_eq!(stack.depth(), 1);
        assert!(stack.top().is_logging());
        assert!(!stack.top().reraises());

        assert_eq!(stack.pop(), Err(HandlerStackError::PopLast));
    }

    #[test]
    fn push_returns_previous_top() {
        let stack = ExceptionHandlerStack::default();
        let previous = stack.push(HandlerRecord::new(|_, _| {}).reraise(true)).unwrap();
        assert!(previous.is_logging());

        let previous = stack.push(HandlerRecord::logging()).unwrap();
        assert!(!previous.is_logging());
        assert!(previous.reraises());
    }

    #[test]
    fn locked_top_rejects_push_and_pop() {
        let stack = ExceptionHandlerStack::default();
        stack.push(HandlerRecord::logging().locked(true)).unwrap();

        assert_eq!(stack.push(HandlerRecord::logging()).unwrap_err(), HandlerStackError::Locked);
        assert_eq!(stack.pop(), Err(HandlerStackError::Locked));
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn handle_invokes_top_handler_and_swallows() {
        let stack = ExceptionHandlerStack::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        stack
            .push(HandlerRecord::new(move |ev, failure| {
                assert_eq!(&*ev.name, "x");
                assert_eq!(failure.to_string(), "boom");
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(stack.handle(&event(), ListenerFailure::msg("boom")).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_reraises_when_requested() {
        let stack = ExceptionHandlerStack::default();
        stack.push(HandlerRecord::new(|_, _| {}).reraise(true)).unwrap();

        let err = stack.handle(&event(), ListenerFailure::msg("boom")).unwrap_err();
        match err {
            Error::Listener { name, source, .. } => {
                assert_eq!(&*name, "x");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn handler_stack_failures_always_propagate() {
        let stack = ExceptionHandlerStack::default();
        let failure = ListenerFailure::Error(Box::new(HandlerStackError::PopLast));
        let err = stack.handle(&event(), failure).unwrap_err();
        assert!(matches!(err, Error::HandlerStack(HandlerStackError::PopLast)));
    }

    #[test]
    fn default_handler_does_not_propagate() {
        let stack = ExceptionHandlerStack::default();
        assert!(stack.handle(&event(), ListenerFailure::Panic("oops".into())).is_ok());
    }

    #[test]
    fn stacks_are_per_thread() {
        let stack = Arc::new(ExceptionHandlerStack::default());
        stack.push(HandlerRecord::new(|_, _| {})).unwrap();
        assert_eq!(stack.depth(), 2);

        let other = Arc::clone(&stack);
        let depth = std::thread::spawn(move || other.depth()).join().unwrap();
        assert_eq!(depth, 1);
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn main_record_seeds_new_threads() {
        let stack = Arc::new(ExceptionHandlerStack::default());
        stack.push_main(HandlerRecord::new(|_, _| {}).reraise(true)).unwrap();

        let other = Arc::clone(&stack);
        let (depth, reraises, logging) = std::thread::spawn(move || {
            let top = other.top();
            (other.depth(), top.reraises(), top.is_logging())
        })
        .join()
        .unwrap();

        assert_eq!(depth, 1);
        assert!(reraises);
        assert!(!logging);
    }

    fn thread_stack_count() -> usize {
        STACKS.with(|stacks| stacks.borrow().len())
    }

    #[test]
    fn log_falls_back_to_stderr_without_subscriber() {
        let stack = ExceptionHandlerStack::default();
        let sink = stack.log_failure(&event(), &ListenerFailure::msg("boom"));
        assert_eq!(sink, LogSink::Stderr);
    }

    #[test]
    fn log_falls_back_to_stderr_when_reentered_too_deeply() {
        let stack = ExceptionHandlerStack::new(2);
        let failure = ListenerFailure::msg("boom");
        let subscriber = tracing_subscriber::fmt().with_writer(std::io::sink).finish();

        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(stack.log_failure(&event(), &failure), LogSink::Tracing);

            let outer = LogDepth::enter();
            assert_eq!(stack.log_failure(&event(), &failure), LogSink::Tracing);

            let inner = LogDepth::enter();
            assert_eq!(stack.log_failure(&event(), &failure), LogSink::Stderr);

            drop(inner);
            assert_eq!(stack.log_failure(&event(), &failure), LogSink::Tracing);
            drop(outer);
        });
        assert_eq!(LogDepth::current(), 0);
    }

    #[test]
    fn report_includes_captured_stack_trace() {
        let failure = ListenerFailure::msg("boom");
        let plain = failure_report(&event(), &failure, &Backtrace::disabled());
        assert!(plain.contains("attribute: x"));
        assert!(plain.ends_with("boom"));
        assert!(!plain.contains("stack backtrace"));

        let traced = failure_report(&event(), &failure, &Backtrace::force_capture());
        assert!(traced.starts_with(&plain));
        assert!(traced.contains("stack backtrace:"));
    }

    #[test]
    fn stacks_of_dropped_engines_are_swept() {
        let first = Arc::new(ExceptionHandlerStack::default());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel();

        let worker_first = Arc::clone(&first);
        let worker = std::thread::spawn(move || {
            worker_first.depth();
            drop(worker_first);
            ready_tx.send(thread_stack_count()).unwrap();
            go_rx.recv().unwrap();

            let second = ExceptionHandlerStack::default();
            second.depth();
            thread_stack_count()
        });

        assert_eq!(ready_rx.recv().unwrap(), 1);
        // The last handle goes away here, not on the worker.
        drop(first);
        go_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), 1);
    }

    #[test]
    fn engines_do_not_share_stacks() {
        let a = ExceptionHandlerStack::default();
        let b = ExceptionHandlerStack::default();
        a.push(HandlerRecord::logging()).unwrap();
        assert_eq!(a.depth(), 2);
        assert_eq!(b.depth(), 1);
    }
}
