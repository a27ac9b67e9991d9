//! Runs a poll-based task on the event loop, and exposes its result as a
//! [`Promise`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};

use log::{debug, trace};

use crate::awaiter::PromiseAwaiter;
use crate::error::{Exception, Result};
use crate::event_loop::{arm_depth_first, Event, EventLink, Executor};
use crate::future::{box_future_poll, BoxFuture, FutureOutput};
use crate::linked_group::{HasLinkedGroup, LinkedGroup};
use crate::promise::{Promise, PromiseState};
use crate::waker::{ThreadAffineWaker, WakeInstruction};

pub(crate) trait PollTarget {
    fn poll(self: Rc<Self>);
    fn reject(&self, e: Exception);
}

/// The part of a driver that awaiters attach to and that the event loop
/// fires. It is not generic over the task's output, so awaiters can refer to
/// it without knowing what the task returns.
pub(crate) struct PollEvent {
    link: EventLink,
    awaiters: LinkedGroup<PollEvent, PromiseAwaiter>,
    target: Weak<dyn PollTarget>,
    this: Weak<PollEvent>,
}

// SAFETY: returns a field of self
unsafe impl HasLinkedGroup<PromiseAwaiter> for PollEvent {
    fn linked_group(&self) -> &LinkedGroup<PollEvent, PromiseAwaiter> {
        &self.awaiters
    }
}

impl PollEvent {
    fn new(target: Weak<dyn PollTarget>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            link: EventLink::default(),
            awaiters: LinkedGroup::new(),
            target,
            this: this.clone(),
        })
    }

    pub(crate) fn pinned(&self) -> Pin<&Self> {
        // SAFETY: poll events only exist inside an Rc, which never moves its
        // contents
        unsafe { Pin::new_unchecked(self) }
    }

    /// Schedule a poll right after the current event.
    pub(crate) fn arm(&self) {
        arm_depth_first(self.this.clone() as Weak<dyn Event>);
    }

    pub(crate) fn awaiter_count(&self) -> usize {
        self.awaiters.len()
    }
}

impl Event for PollEvent {
    fn link(&self) -> &EventLink {
        &self.link
    }

    fn fire(self: Rc<Self>) {
        if let Some(target) = self.target.upgrade() {
            target.poll();
        }
    }
}

// Waits for a cloned waker to be woken, or for all clones to go away.
struct SignalAwaiter {
    link: EventLink,
    promise: RefCell<Option<Promise<WakeInstruction>>>,
    event: Weak<PollEvent>,
}

impl Event for SignalAwaiter {
    fn link(&self) -> &EventLink {
        &self.link
    }

    fn fire(self: Rc<Self>) {
        let Some(promise) = self.promise.borrow_mut().take() else {
            return;
        };

        let Some(event) = self.event.upgrade() else {
            return;
        };

        match promise.into_ready() {
            Ok(WakeInstruction::Wake) => event.arm(),
            Ok(WakeInstruction::Ignore) => {
                debug!("all waker clones dropped without waking, task is stalled");
            }
            Err(e) => {
                if let Some(target) = event.target.upgrade() {
                    target.reject(e);
                }
            }
        }
    }
}

pub(crate) struct Driver<T: FutureOutput> {
    event: Rc<PollEvent>,
    future: RefCell<BoxFuture<T>>,
    signal: RefCell<Option<Rc<SignalAwaiter>>>,
    output: Weak<PromiseState<T::Value>>,
    polls: Cell<usize>,
    signals: Cell<usize>,
}

impl<T: FutureOutput> Driver<T> {
    /// Poll `future` once, then again whenever it is woken, until it
    /// completes. Dropping the returned promise drops the task.
    ///
    /// # Panics
    ///
    /// Panics if no `EventLoop` is running on this thread.
    pub(crate) fn new(future: BoxFuture<T>) -> (Rc<Self>, Promise<T::Value>) {
        let state = Promise::<T::Value>::new_state();

        let driver = Rc::new_cyclic(|this: &Weak<Self>| Self {
            event: PollEvent::new(this.clone() as Weak<dyn PollTarget>),
            future: RefCell::new(future),
            signal: RefCell::new(None),
            output: Rc::downgrade(&state),
            polls: Cell::new(0),
            signals: Cell::new(0),
        });

        Rc::clone(&driver).poll();

        let promise = Promise::with_owner(state, Rc::clone(&driver) as Rc<dyn Any>);

        (driver, promise)
    }

    pub(crate) fn poll_event(&self) -> &Rc<PollEvent> {
        &self.event
    }

    pub(crate) fn polls(&self) -> usize {
        self.polls.get()
    }

    /// Number of cross-thread signals allocated for this task.
    pub(crate) fn signals(&self) -> usize {
        self.signals.get()
    }

    fn finish(&self, result: Result<T::Value>) {
        // destroy the task outside of the borrow, since its destructor may
        // run arbitrary code
        let future = self.future.borrow_mut().take();
        drop(future);

        self.signal.borrow_mut().take();

        if let Some(output) = self.output.upgrade() {
            output.resolve(result);
        }
    }
}

impl<T: FutureOutput> PollTarget for Driver<T> {
    fn poll(self: Rc<Self>) {
        // a fresh waker is lent for every poll, so an older signal is stale
        self.signal.borrow_mut().take();

        if self.future.borrow().is_empty() {
            return;
        }

        self.polls.set(self.polls.get() + 1);
        trace!(
            "driver poll #{} (fallible: {})",
            self.polls.get(),
            T::FALLIBLE
        );

        let mut waker =
            ThreadAffineWaker::with_poll_event(Executor::current(), Rc::clone(&self.event));
        let mut value = None;

        let result = {
            let future = &mut *self.future.borrow_mut();

            box_future_poll(future, &waker, &mut value)
        };

        match result {
            Ok(true) => {
                if let Some(value) = value {
                    self.finish(Ok(value));
                }
            }
            Ok(false) => {
                let state = waker.reset();

                if state.wake_count > 0 {
                    trace!("woken during poll, polling again");

                    self.event.arm();
                } else if let Some(promise) = state.cloned {
                    self.signals.set(self.signals.get() + 1);

                    let awaiter = Rc::new(SignalAwaiter {
                        link: EventLink::default(),
                        promise: RefCell::new(None),
                        event: Rc::downgrade(&self.event),
                    });

                    promise.on_ready(Rc::downgrade(&awaiter) as Weak<dyn Event>);
                    *awaiter.promise.borrow_mut() = Some(promise);

                    *self.signal.borrow_mut() = Some(awaiter);
                }
            }
            Err(e) => {
                trace!("task failed: {e}");

                self.finish(Err(e));
            }
        }
    }

    fn reject(&self, e: Exception) {
        self.finish(Err(e));
    }
}

impl<T: FutureOutput> fmt::Debug for Driver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("fallible", &T::FALLIBLE)
            .field("polls", &self.polls())
            .field("signals", &self.signals())
            .field("awaiters", &self.poll_event().awaiter_count())
            .field("done", &self.future.borrow().is_empty())
            .finish()
    }
}

impl<T: FutureOutput> BoxFuture<T> {
    /// Run the task on the current thread's event loop. It is polled once
    /// right away, then whenever it is woken. Dropping the promise cancels
    /// the task.
    ///
    /// # Panics
    ///
    /// Panics if no `EventLoop` is running on this thread.
    pub fn into_promise(self) -> Promise<T::Value> {
        let (_, promise) = Driver::new(self);

        promise
    }
}

impl<T: 'static> Promise<T> {
    /// Run `fut` on the current thread's event loop. See
    /// [`BoxFuture::into_promise`].
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future + Send + 'static,
        F::Output: FutureOutput<Value = T>,
    {
        BoxFuture::new(fut).into_promise()
    }
}
