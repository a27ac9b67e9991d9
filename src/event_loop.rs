//! The continuation-model side of the bridge: a single-threaded event loop
//! which fires armed events in order, plus the executor handle other threads
//! use to deliver values onto it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use log::{error, trace, warn};

use crate::error::{Exception, Result};
use crate::promise::Promise;

// =======================================================================================
// Events

/// Per-event bookkeeping. Every [`Event`] implementation embeds one.
#[derive(Default)]
pub(crate) struct EventLink {
    armed: Cell<bool>,
}

/// Something the event loop can fire. The loop only holds weak references to
/// armed events, so dropping an armed event cancels it.
pub(crate) trait Event {
    fn link(&self) -> &EventLink;
    fn fire(self: Rc<Self>);
}

#[derive(Clone, Copy)]
enum Order {
    DepthFirst,
    BreadthFirst,
}

/// Arm `event` to fire right after the currently firing event, ahead of
/// everything already queued. Events armed depth-first during one callback
/// fire in the order they were armed.
pub(crate) fn arm_depth_first(event: Weak<dyn Event>) {
    arm(event, Order::DepthFirst)
}

/// Arm `event` to fire after everything already queued.
pub(crate) fn arm_breadth_first(event: Weak<dyn Event>) {
    arm(event, Order::BreadthFirst)
}

fn arm(event: Weak<dyn Event>, order: Order) {
    let Some(strong) = event.upgrade() else {
        return;
    };

    if strong.link().armed.replace(true) {
        // already queued
        return;
    }

    match current_loop() {
        Some(l) => match order {
            Order::DepthFirst => l.depth_first.borrow_mut().push(event),
            Order::BreadthFirst => l.queue.borrow_mut().push_back(event),
        },
        None => {
            strong.link().armed.set(false);
            warn!("event armed with no EventLoop running on this thread, ignoring");
        }
    }
}

// =======================================================================================
// EventLoop

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

fn current_loop() -> Option<Rc<LoopInner>> {
    CURRENT.try_with(|c| c.borrow().clone()).ok().flatten()
}

struct LoopInner {
    name: Option<String>,
    executor: Executor,
    queue: RefCell<VecDeque<Weak<dyn Event>>>,
    depth_first: RefCell<Vec<Weak<dyn Event>>>,

    // events waiting on values from other threads, keyed by the token the
    // sending side pushes onto the executor's queue
    listeners: RefCell<HashMap<u64, Weak<dyn Event>>>,
    next_token: Cell<u64>,

    running: Cell<bool>,
}

impl LoopInner {
    fn flush_depth_first(&self) {
        let mut staged = self.depth_first.borrow_mut();
        if staged.is_empty() {
            return;
        }

        let mut queue = self.queue.borrow_mut();
        for event in staged.drain(..).rev() {
            queue.push_front(event);
        }
    }

    // Fire one event. Returns false if the queue was empty.
    fn turn(&self) -> bool {
        self.flush_depth_first();

        let next = self.queue.borrow_mut().pop_front();
        let Some(event) = next else {
            return false;
        };

        if let Some(event) = event.upgrade() {
            event.link().armed.set(false);

            let was_running = self.running.replace(true);
            event.fire();
            self.running.set(was_running);
        }

        true
    }

    // Move tokens delivered by other threads onto the queue. If `block` is
    // set and nothing has arrived yet, sleep until something does, unless no
    // listener could ever be notified. Returns false if nothing was received.
    fn receive_cross_thread(&self, block: bool) -> bool {
        let tokens = {
            let shared = &self.executor.shared;
            let mut pending = shared.pending.lock().unwrap();

            if block {
                while pending.is_empty() {
                    if self.listeners.borrow().is_empty() {
                        return false;
                    }

                    trace!("{}: sleeping until a cross-thread delivery", self);
                    pending = shared.ready.wait(pending).unwrap();
                }
            }

            mem::take(&mut *pending)
        };

        if tokens.is_empty() {
            return false;
        }

        for token in tokens {
            let event = self.listeners.borrow().get(&token).cloned();
            if let Some(event) = event {
                arm_breadth_first(event);
            }
        }

        true
    }
}

impl fmt::Display for LoopInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "EventLoop({name})"),
            None => write!(f, "EventLoop"),
        }
    }
}

/// Register `event` to be armed when a cross-thread sender delivers the
/// returned token. Returns `None` if no loop is running on this thread.
pub(crate) fn register_listener(event: Weak<dyn Event>) -> Option<u64> {
    let l = current_loop()?;

    let token = l.next_token.get();
    l.next_token.set(token + 1);
    l.listeners.borrow_mut().insert(token, event);

    Some(token)
}

pub(crate) fn unregister_listener(token: u64) {
    if let Some(l) = current_loop() {
        l.listeners.borrow_mut().remove(&token);
    }
}

/// Configures an [`EventLoop`] before it is installed on the current thread.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the loop. The name shows up in log records.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Create the loop and make it the current thread's loop.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already has an `EventLoop`.
    pub fn build(self) -> EventLoop {
        let inner = Rc::new(LoopInner {
            name: self.name,
            executor: Executor {
                shared: Arc::new(ExecutorShared {
                    thread: thread::current().id(),
                    pending: Mutex::new(Vec::new()),
                    ready: Condvar::new(),
                }),
            },
            queue: RefCell::new(VecDeque::new()),
            depth_first: RefCell::new(Vec::new()),
            listeners: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
            running: Cell::new(false),
        });

        CURRENT.with(|c| {
            let c = &mut *c.borrow_mut();
            assert!(
                c.is_none(),
                "an EventLoop is already running on this thread"
            );
            *c = Some(Rc::clone(&inner));
        });

        trace!("{}: installed", inner);

        EventLoop { inner }
    }
}

/// A single-threaded, cooperative event loop. Creating one installs it as
/// the current thread's loop; promises, drivers and awaiters created on this
/// thread are bound to it.
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn executor(&self) -> Executor {
        self.inner.executor.clone()
    }

    /// Fire events until there is nothing left to do right now, without
    /// blocking. Returns the number of events fired.
    pub fn run(&self) -> usize {
        let mut fired = 0;

        loop {
            self.inner.receive_cross_thread(false);

            if !self.inner.turn() {
                break;
            }

            fired += 1;
        }

        fired
    }

    /// Turn the loop until `promise` is ready and return its result. When
    /// the queue is empty this sleeps until another thread delivers
    /// something.
    ///
    /// Returns an error if the queue is empty and nothing on any thread can
    /// still make progress, meaning the promise will never complete.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an event callback.
    pub fn wait<T: 'static>(&self, promise: Promise<T>) -> Result<T> {
        assert!(
            !self.inner.running.get(),
            "EventLoop::wait() called from inside an event callback"
        );

        loop {
            if promise.is_ready() {
                return promise.into_ready();
            }

            self.inner.receive_cross_thread(false);

            if self.inner.turn() {
                continue;
            }

            if !self.inner.receive_cross_thread(true) {
                trace!("{}: wait() found nothing left to do", self.inner);
                return Err(Exception::failed("promise will never complete"));
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("queued", &self.inner.queue.borrow().len())
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // unhook first, so anything dropped below doesn't try to arm onto us
        let _ = CURRENT.try_with(|c| c.borrow_mut().take());

        self.inner.queue.borrow_mut().clear();
        self.inner.depth_first.borrow_mut().clear();
        self.inner.listeners.borrow_mut().clear();

        trace!("{}: uninstalled", self.inner);
    }
}

// =======================================================================================
// Executor

struct ExecutorShared {
    thread: ThreadId,
    pending: Mutex<Vec<u64>>,
    ready: Condvar,
}

/// A cloneable, thread-safe handle identifying one [`EventLoop`]. Other
/// threads use it to deliver values onto the loop; the loop's own thread
/// uses it for affinity checks.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
}

impl Executor {
    /// The executor of the current thread's loop.
    ///
    /// # Panics
    ///
    /// Panics if no `EventLoop` is running on this thread.
    pub fn current() -> Self {
        match Self::try_current() {
            Some(executor) => executor,
            None => panic!("no EventLoop is running on this thread"),
        }
    }

    pub fn try_current() -> Option<Self> {
        current_loop().map(|l| l.executor.clone())
    }

    /// Returns true if this executor's loop is the one running on the
    /// calling thread.
    pub fn is_current(&self) -> bool {
        current_loop().is_some_and(|l| Arc::ptr_eq(&l.executor.shared, &self.shared))
    }

    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    // Safe to call from any thread.
    pub(crate) fn notify(&self, token: u64) {
        self.shared.pending.lock().unwrap().push(token);
        self.shared.ready.notify_one();
    }
}

impl PartialEq for Executor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Executor {}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

// =======================================================================================
// ExecutorGuarded

/// Wraps a value which may only be touched on the thread whose loop was
/// current when the wrapper was created.
///
/// The wrapper can be sent and shared across threads, which is what lets
/// `!Send` continuation-model state sit inside `Send` futures, but every
/// access checks the calling thread. Accessing it from the wrong thread
/// panics. Dropping it on the wrong thread aborts the process, since the
/// value cannot be dropped safely and leaking it would hide the bug.
pub struct ExecutorGuarded<T> {
    executor: Executor,
    value: ManuallyDrop<T>,
}

// SAFETY: `value` is only reachable through `get`, `get_mut`, `try_get` and
// `Drop`, all of which verify the calling thread runs `executor`'s loop.
unsafe impl<T> Send for ExecutorGuarded<T> {}
unsafe impl<T> Sync for ExecutorGuarded<T> {}

impl<T> ExecutorGuarded<T> {
    /// # Panics
    ///
    /// Panics if no `EventLoop` is running on this thread.
    pub fn new(value: T) -> Self {
        Self {
            executor: Executor::current(),
            value: ManuallyDrop::new(value),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn get(&self) -> &T {
        self.assert_current();
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.assert_current();
        &mut self.value
    }

    /// Like [`get`](Self::get), but returns `None` instead of panicking on
    /// the wrong thread.
    pub fn try_get(&self) -> Option<&T> {
        if self.executor.is_current() {
            Some(&self.value)
        } else {
            None
        }
    }

    fn assert_current(&self) {
        assert!(
            self.executor.is_current(),
            "ExecutorGuarded value accessed from a thread other than its event loop's ({:?})",
            self.executor.thread_id(),
        );
    }
}

impl<T> Drop for ExecutorGuarded<T> {
    fn drop(&mut self) {
        // the loop itself may already be gone, only the thread matters here
        if thread::current().id() == self.executor.thread_id() {
            // SAFETY: the value is never touched again
            unsafe { ManuallyDrop::drop(&mut self.value) };
        } else if thread::panicking() {
            // already going down; leak rather than turn a panic into an abort
        } else {
            error!(
                "ExecutorGuarded value dropped off its event loop's thread ({:?}), aborting",
                self.executor.thread_id(),
            );
            std::process::abort();
        }
    }
}

impl<T> fmt::Debug for ExecutorGuarded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorGuarded")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        link: EventLink,
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
        depth_first: RefCell<Vec<Weak<dyn Event>>>,
        breadth_first: RefCell<Vec<Weak<dyn Event>>>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Rc<Self> {
            Rc::new(Self {
                link: EventLink::default(),
                name,
                log: Rc::clone(log),
                depth_first: RefCell::new(Vec::new()),
                breadth_first: RefCell::new(Vec::new()),
            })
        }
    }

    impl Event for Recorder {
        fn link(&self) -> &EventLink {
            &self.link
        }

        fn fire(self: Rc<Self>) {
            self.log.borrow_mut().push(self.name);

            for event in self.depth_first.borrow_mut().drain(..) {
                arm_depth_first(event);
            }
            for event in self.breadth_first.borrow_mut().drain(..) {
                arm_breadth_first(event);
            }
        }
    }

    fn weak(event: &Rc<Recorder>) -> Weak<dyn Event> {
        Rc::downgrade(event) as Weak<dyn Event>
    }

    #[test]
    fn test_arm_order() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let a = Recorder::new("a", &log);
        let b = Recorder::new("b", &log);
        let c = Recorder::new("c", &log);
        let d = Recorder::new("d", &log);
        let e = Recorder::new("e", &log);

        a.depth_first.borrow_mut().push(weak(&c));
        a.depth_first.borrow_mut().push(weak(&d));
        a.breadth_first.borrow_mut().push(weak(&e));

        arm_breadth_first(weak(&a));
        arm_breadth_first(weak(&b));

        assert_eq!(event_loop.run(), 5);
        assert_eq!(*log.borrow(), vec!["a", "c", "d", "b", "e"]);
    }

    #[test]
    fn test_arm_twice_fires_once() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let a = Recorder::new("a", &log);
        arm_breadth_first(weak(&a));
        arm_depth_first(weak(&a));
        assert!(a.link.armed.get());

        assert_eq!(event_loop.run(), 1);
        assert_eq!(*log.borrow(), vec!["a"]);
        assert!(!a.link.armed.get());
    }

    #[test]
    fn test_dropped_event_is_cancelled() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let a = Recorder::new("a", &log);
        arm_breadth_first(weak(&a));
        drop(a);

        event_loop.run();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_wait_never_completes() {
        let event_loop = EventLoop::new();

        let e = event_loop.wait(Promise::<()>::never()).unwrap_err();
        assert_eq!(e.description(), "promise will never complete");
    }

    #[test]
    fn test_builder_name() {
        let event_loop = EventLoop::builder().name("main").build();
        assert_eq!(event_loop.name(), Some("main"));
        assert!(event_loop.executor().is_current());
        assert_eq!(event_loop.executor(), Executor::current());
        assert_eq!(event_loop.executor().thread_id(), thread::current().id());
    }

    #[test]
    #[should_panic(expected = "already running")]
    fn test_one_loop_per_thread() {
        let _a = EventLoop::new();
        let _b = EventLoop::new();
    }

    #[test]
    fn test_loop_uninstalls_on_drop() {
        let event_loop = EventLoop::new();
        let executor = event_loop.executor();
        drop(event_loop);

        assert!(!executor.is_current());
        assert!(Executor::try_current().is_none());

        let _again = EventLoop::new();
    }

    #[test]
    fn test_executor_guarded_wrong_thread() {
        let _event_loop = EventLoop::new();
        let guarded = ExecutorGuarded::new(Rc::new(5));

        assert_eq!(**guarded.get(), 5);

        thread::scope(|s| {
            let handle = s.spawn(|| {
                assert!(guarded.try_get().is_none());
                let _ = guarded.get();
            });
            assert!(handle.join().is_err());
        });

        // still usable on the owning thread
        assert_eq!(**guarded.get(), 5);
    }
}
