use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::ptr;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use log::trace;
use static_assertions::assert_eq_size;

use crate::driver::PollEvent;
use crate::error::Result;
use crate::event_loop::{Event, EventLink, ExecutorGuarded};
use crate::linked_group::{HasLinkedObject, LinkedObject};
use crate::promise::{OwnPromiseNode, Promise};
use crate::waker::ThreadAffineWaker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Registered,
    Ready,
    Consumed,
}

/// Lets a poll-based task wait on a continuation-model promise.
///
/// The awaiter registers itself as the promise's continuation. When polled
/// through a [`ThreadAffineWaker`] lent by a driver on the current thread,
/// it attaches to that driver and, once the promise is ready, re-arms the
/// driver directly. Polled with any other waker, it keeps a clone of the
/// waker and wakes it instead.
pub struct PromiseAwaiter {
    link: EventLink,
    linked: LinkedObject<PollEvent, PromiseAwaiter>,
    waker: RefCell<Option<Waker>>,
    node: RefCell<Option<OwnPromiseNode>>,
    state: Cell<State>,
}

// SAFETY: returns a field of self
unsafe impl HasLinkedObject<PollEvent> for PromiseAwaiter {
    fn linked_object(&self) -> &LinkedObject<PollEvent, PromiseAwaiter> {
        &self.linked
    }
}

// five link words, two RefCell-guarded fat pointers, and the flag bytes
assert_eq_size!(PromiseAwaiter, [usize; 12]);

impl PromiseAwaiter {
    pub fn new(node: OwnPromiseNode) -> Rc<Self> {
        let awaiter = Rc::new(Self {
            link: EventLink::default(),
            linked: LinkedObject::new(),
            waker: RefCell::new(None),
            node: RefCell::new(None),
            state: Cell::new(State::Registered),
        });

        node.on_ready(Rc::downgrade(&awaiter) as Weak<dyn Event>);
        *awaiter.node.borrow_mut() = Some(node);

        awaiter
    }

    fn pinned(&self) -> Pin<&Self> {
        // SAFETY: awaiters only exist inside an Rc, which never moves its
        // contents
        unsafe { Pin::new_unchecked(self) }
    }

    /// Returns true once the promise is ready. Otherwise arranges for
    /// `waker`, or the driver it belongs to, to be woken when it is.
    ///
    /// # Panics
    ///
    /// Panics if called after [`take`](Self::take), or if the awaiter is
    /// attached to a live driver other than the one `waker` belongs to.
    pub fn poll(&self, waker: &Waker) -> bool {
        match self.state.get() {
            State::Ready => return true,
            State::Consumed => panic!("PromiseAwaiter polled after its result was taken"),
            State::Registered => {}
        }

        if self.node.borrow().as_ref().is_some_and(|n| n.is_ready()) {
            self.set_ready();
            return true;
        }

        match ThreadAffineWaker::try_from_waker(waker).and_then(|w| w.poll_event()) {
            Some(event) => {
                if let Some(current) = self.linked.try_get() {
                    assert!(
                        ptr::eq(current.get_ref(), &**event),
                        "PromiseAwaiter polled by a different driver than the one it is attached to"
                    );
                }

                LinkedObject::link(self.pinned(), event.pinned());

                self.waker.borrow_mut().take();
            }
            None => {
                self.linked.invalidate();

                let stored = &mut *self.waker.borrow_mut();

                if !stored.as_ref().is_some_and(|w| w.will_wake(waker)) {
                    *stored = Some(waker.clone());
                }
            }
        }

        false
    }

    pub fn is_ready(&self) -> bool {
        self.state.get() == State::Ready
    }

    /// Returns true if attached to a driver.
    pub fn is_linked(&self) -> bool {
        self.linked.is_linked()
    }

    /// Take the ready promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise isn't ready yet, or if called twice.
    pub fn take(&self) -> OwnPromiseNode {
        match self.state.get() {
            State::Ready => {}
            State::Registered => {
                panic!("PromiseAwaiter::take() called before the promise was ready")
            }
            State::Consumed => panic!("PromiseAwaiter::take() called twice"),
        }

        self.state.set(State::Consumed);

        match self.node.borrow_mut().take() {
            Some(node) => node,
            None => panic!("PromiseAwaiter has no promise"),
        }
    }

    fn set_ready(&self) {
        self.state.set(State::Ready);
        self.linked.invalidate();
        self.waker.borrow_mut().take();
    }
}

impl Event for PromiseAwaiter {
    fn link(&self) -> &EventLink {
        &self.link
    }

    fn fire(self: Rc<Self>) {
        if self.state.get() != State::Registered {
            return;
        }

        self.state.set(State::Ready);

        if let Some(event) = self.linked.try_get() {
            trace!("promise ready, re-arming attached driver");

            event.arm();
            self.linked.invalidate();

            return;
        }

        let waker = self.waker.borrow_mut().take();

        if let Some(waker) = waker {
            trace!("promise ready, waking stored waker");

            waker.wake();
        }
    }
}

impl fmt::Debug for PromiseAwaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseAwaiter")
            .field("state", &self.state.get())
            .field("linked", &self.linked.is_linked())
            .finish()
    }
}

struct FutureState<T> {
    promise: Option<Promise<T>>,
    awaiter: Option<Rc<PromiseAwaiter>>,
}

/// A [`Promise`] as a `Future`. It is `Send`, so it can live inside futures
/// that are, but it may only be polled and dropped on the promise's thread.
pub struct PromiseFuture<T> {
    inner: ExecutorGuarded<FutureState<T>>,
}

// executor handle, then the pending promise (state and owner) and the awaiter
assert_eq_size!(PromiseFuture<()>, [usize; 5]);
assert_eq_size!(PromiseFuture<String>, [usize; 5]);

impl<T: 'static> Future for PromiseFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = self.get_mut().inner.get_mut();

        if let Some(promise) = state.promise.take() {
            state.awaiter = Some(PromiseAwaiter::new(promise.into()));
        }

        let Some(awaiter) = &state.awaiter else {
            panic!("PromiseFuture polled after completion");
        };

        if !awaiter.poll(cx.waker()) {
            return Poll::Pending;
        }

        let node = awaiter.take();
        state.awaiter = None;

        Poll::Ready(node.into_promise::<T>().into_ready())
    }
}

impl<T: 'static> IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = PromiseFuture<T>;

    /// # Panics
    ///
    /// Panics if no `EventLoop` is running on this thread.
    fn into_future(self) -> Self::IntoFuture {
        PromiseFuture {
            inner: ExecutorGuarded::new(FutureState {
                promise: Some(self),
                awaiter: None,
            }),
        }
    }
}

impl<T> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Exception;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let w = Arc::new(CountingWaker(AtomicUsize::new(0)));

        (Arc::clone(&w), Waker::from(w))
    }

    #[test]
    fn test_generic_waker() {
        let event_loop = EventLoop::new();
        let (count, waker) = counting_waker();

        let (p, fulfiller) = Promise::new_paf();
        let awaiter = PromiseAwaiter::new(p.into());

        assert!(!awaiter.poll(&waker));
        assert!(!awaiter.poll(&waker));
        assert!(!awaiter.is_linked());

        fulfiller.fulfill(3u32);
        event_loop.run();

        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(awaiter.is_ready());
        assert!(awaiter.poll(&waker));

        let p: Promise<u32> = awaiter.take().into_promise();
        assert_eq!(p.wait(&event_loop), Ok(3));
    }

    #[test]
    fn test_already_ready() {
        let _event_loop = EventLoop::new();
        let (count, waker) = counting_waker();

        let awaiter = PromiseAwaiter::new(Promise::ready(()).into());
        assert!(awaiter.poll(&waker));
        assert!(awaiter.poll(&waker));
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "before the promise was ready")]
    fn test_take_early() {
        let _event_loop = EventLoop::new();

        let awaiter = PromiseAwaiter::new(Promise::<()>::never().into());
        awaiter.take();
    }

    #[test]
    #[should_panic(expected = "called twice")]
    fn test_take_twice() {
        let _event_loop = EventLoop::new();
        let waker = futures::task::noop_waker();

        let awaiter = PromiseAwaiter::new(Promise::ready(()).into());
        assert!(awaiter.poll(&waker));

        let _ = awaiter.take();
        let _ = awaiter.take();
    }

    #[test]
    fn test_sequential_awaits_of_shared_value() {
        let event_loop = EventLoop::new();
        let (count, waker) = counting_waker();

        let (p, fulfiller) = Promise::new_paf();
        let forked = p.fork();

        let first = PromiseAwaiter::new(forked.add_branch().into());
        assert!(!first.poll(&waker));
        drop(first);

        let second = PromiseAwaiter::new(forked.add_branch().into());
        assert!(!second.poll(&waker));

        fulfiller.fulfill(String::from("shared"));
        event_loop.run();

        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(second.poll(&waker));

        let p: Promise<String> = second.take().into_promise();
        assert_eq!(p.wait(&event_loop), Ok(String::from("shared")));
    }

    #[test]
    fn test_promise_future() {
        let event_loop = EventLoop::new();
        let (count, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let (p, fulfiller) = Promise::<u32>::new_paf();
        let mut fut = p.into_future();

        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());

        fulfiller.reject(Exception::failed("boom"));
        event_loop.run();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        match Pin::new(&mut fut).poll(&mut cx) {
            Poll::Ready(Err(e)) => assert_eq!(e.description(), "boom"),
            _ => panic!("expected failure"),
        }
    }
}
