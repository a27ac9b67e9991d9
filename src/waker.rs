use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{RawWaker, RawWakerVTable, Wake, Waker};

use log::{debug, trace};

use crate::driver::PollEvent;
use crate::event_loop::{Executor, ExecutorGuarded};
use crate::promise::{CrossThreadFulfiller, CrossThreadSource, Promise};

/// What a [`CrossThreadSignal`] tells its driver once it is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeInstruction {
    /// Every clone was dropped without waking. Nothing will ever wake the
    /// task through this signal.
    Ignore,

    /// Poll the task again.
    Wake,
}

// =======================================================================================
// CrossThreadSignal

/// A waker that can be cloned, woken and dropped from any thread. Waking it
/// delivers [`WakeInstruction::Wake`] to the paired promise on the owning
/// loop. If the last clone is dropped without waking, the promise receives
/// [`WakeInstruction::Ignore`] instead.
pub struct CrossThreadSignal {
    fulfiller: CrossThreadFulfiller<WakeInstruction>,
}

impl CrossThreadSignal {
    /// May be called from any thread. The returned source must be turned
    /// into a promise on `executor`'s thread.
    pub fn new(executor: &Executor) -> (Arc<Self>, CrossThreadSource<WakeInstruction>) {
        let (fulfiller, source) = executor.new_cross_thread_channel();

        (Arc::new(Self { fulfiller }), source)
    }

    pub fn is_woken(&self) -> bool {
        self.fulfiller.is_fulfilled()
    }
}

impl Wake for CrossThreadSignal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.fulfiller.fulfill(WakeInstruction::Wake) {
            trace!("cross-thread signal woken");
        }
    }
}

impl Drop for CrossThreadSignal {
    fn drop(&mut self) {
        self.fulfiller.fulfill(WakeInstruction::Ignore);
    }
}

impl fmt::Debug for CrossThreadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossThreadSignal")
            .field("woken", &self.is_woken())
            .finish()
    }
}

// =======================================================================================
// No-op waker

static NOOP_VTABLE: RawWakerVTable =
    RawWakerVTable::new(|_| noop_raw_waker(), |_| {}, |_| {}, |_| {});

fn noop_raw_waker() -> RawWaker {
    RawWaker::new(ptr::null(), &NOOP_VTABLE)
}

#[cfg(test)]
fn is_noop(waker: &Waker) -> bool {
    ptr::eq(waker.vtable(), &NOOP_VTABLE)
}

// =======================================================================================
// ThreadAffineWaker

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    let w = unsafe { (data as *const ThreadAffineWaker).as_ref().unwrap() };

    w.clone_raw()
}

unsafe fn wake_fn(data: *const ()) {
    let w = unsafe { (data as *const ThreadAffineWaker).as_ref().unwrap() };

    w.wake_by_ref();
    w.drop_ref();
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    let w = unsafe { (data as *const ThreadAffineWaker).as_ref().unwrap() };

    w.wake_by_ref();
}

unsafe fn drop_fn(data: *const ()) {
    let w = unsafe { (data as *const ThreadAffineWaker).as_ref().unwrap() };

    w.drop_ref();
}

// a static rather than a const, so identity checks by address are reliable
static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

/// What happened to a [`ThreadAffineWaker`] during one poll.
#[derive(Debug)]
pub struct WakerState {
    /// Number of synchronous wakes.
    pub wake_count: usize,

    /// Set if the waker was cloned. Completes with
    /// [`WakeInstruction::Wake`] once any clone is woken, or
    /// [`WakeInstruction::Ignore`] once all clones are dropped.
    pub cloned: Option<Promise<WakeInstruction>>,
}

/// A waker lent to a task for the duration of a single poll, bound to the
/// executor that was current when it was created.
///
/// Synchronous wakes are just counted. Cloning allocates a
/// [`CrossThreadSignal`] on first use and hands out references to it, unless
/// the task was already woken, in which case clones are no-ops since a
/// re-poll is coming anyway. Only cloning and waking may happen on other
/// threads.
///
/// After the poll returns, [`reset`](Self::reset) reports what the task did.
pub struct ThreadAffineWaker {
    executor: Executor,
    signal: Mutex<Option<(Arc<CrossThreadSignal>, CrossThreadSource<WakeInstruction>)>>,
    wake_count: AtomicUsize,
    drop_count: AtomicUsize,

    // the driver doing the polling, if any
    poll_event: Option<ExecutorGuarded<Rc<PollEvent>>>,
}

impl ThreadAffineWaker {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            signal: Mutex::new(None),
            wake_count: AtomicUsize::new(0),
            drop_count: AtomicUsize::new(0),
            poll_event: None,
        }
    }

    pub(crate) fn with_poll_event(executor: Executor, poll_event: Rc<PollEvent>) -> Self {
        Self {
            poll_event: Some(ExecutorGuarded::new(poll_event)),
            ..Self::new(executor)
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Lend a `Waker` referring to this object. It must be dropped exactly
    /// once before calling [`reset`](Self::reset).
    pub fn lend(&self) -> LentWaker<'_> {
        let rw = RawWaker::new(self as *const Self as *const (), &VTABLE);

        LentWaker {
            // SAFETY: the waker can't outlive the borrow of self, and clones
            // never refer to self
            waker: unsafe { Waker::from_raw(rw) },
            _marker: PhantomData,
        }
    }

    /// If `waker` is a `ThreadAffineWaker` belonging to the current thread's
    /// executor, return it.
    pub fn try_from_waker(waker: &Waker) -> Option<&Self> {
        if !ptr::eq(waker.vtable(), &VTABLE) {
            return None;
        }

        // SAFETY: only lend() creates wakers with this vtable, and the
        // borrow of self outlives them
        let w = unsafe { (waker.data() as *const Self).as_ref()? };

        if w.executor.is_current() {
            Some(w)
        } else {
            None
        }
    }

    // Panics if `waker` is a lent ThreadAffineWaker whose executor isn't the
    // current thread's. Other wakers pass.
    pub(crate) fn assert_usable_from(waker: &Waker) {
        if !ptr::eq(waker.vtable(), &VTABLE) {
            return;
        }

        // SAFETY: only lend() creates wakers with this vtable, and the
        // borrow of self outlives them
        if let Some(w) = unsafe { (waker.data() as *const Self).as_ref() } {
            assert!(
                w.executor.is_current(),
                "lent waker used off its executor's thread"
            );
        }
    }

    pub(crate) fn poll_event(&self) -> Option<&Rc<PollEvent>> {
        self.poll_event.as_ref().map(|e| e.get())
    }

    /// Report and clear what happened since the waker was lent.
    ///
    /// # Panics
    ///
    /// Panics if called off the executor's thread, or if the lent waker was
    /// not dropped exactly once.
    pub fn reset(&mut self) -> WakerState {
        assert!(
            self.executor.is_current(),
            "ThreadAffineWaker::reset() called off its executor's thread"
        );

        let drops = self.drop_count.swap(0, Ordering::AcqRel);
        assert_eq!(drops, 1, "lent waker dropped {drops} times");

        let wake_count = self.wake_count.swap(0, Ordering::AcqRel);

        // our own reference to the signal goes away here. if the task kept
        // no clones, the promise resolves to Ignore right away
        let cloned = self
            .signal
            .get_mut()
            .unwrap()
            .take()
            .map(|(_, source)| source.into_promise());

        WakerState { wake_count, cloned }
    }

    fn clone_raw(&self) -> RawWaker {
        if self.wake_count.load(Ordering::Acquire) > 0 {
            // already woken. the task will be polled again regardless
            return noop_raw_waker();
        }

        let signal = &mut *self.signal.lock().unwrap();

        let (signal, _) = signal.get_or_insert_with(|| {
            debug!("waker cloned, allocating cross-thread signal");

            CrossThreadSignal::new(&self.executor)
        });

        let inner = ManuallyDrop::new(Waker::from(Arc::clone(signal)));

        RawWaker::new(inner.data(), inner.vtable())
    }

    fn wake_by_ref(&self) {
        self.wake_count.fetch_add(1, Ordering::AcqRel);
    }

    fn drop_ref(&self) {
        assert!(
            self.executor.is_current(),
            "lent waker dropped off its executor's thread"
        );

        self.drop_count.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ThreadAffineWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadAffineWaker")
            .field("executor", &self.executor)
            .field("wake_count", &self.wake_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A `Waker` borrowed from a [`ThreadAffineWaker`].
pub struct LentWaker<'a> {
    waker: Waker,
    _marker: PhantomData<&'a ThreadAffineWaker>,
}

impl Deref for LentWaker<'_> {
    type Target = Waker;

    fn deref(&self) -> &Self::Target {
        &self.waker
    }
}
