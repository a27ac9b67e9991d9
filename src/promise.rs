//! Continuation-model promises. A [`Promise`] is a single-consumer handle to
//! a value that some producer will deliver on the event loop. Dropping a
//! promise drops its producer, which is how cancellation works.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::error::{Exception, Result};
use crate::event_loop::{
    arm_breadth_first, register_listener, unregister_listener, Event, EventLink, EventLoop,
    Executor,
};

// =======================================================================================
// Shared state

enum Slot<T> {
    Pending(Option<Weak<dyn Event>>),
    Ready(Result<T>),
    Taken,
}

pub(crate) struct PromiseState<T> {
    slot: RefCell<Slot<T>>,
}

impl<T> PromiseState<T> {
    fn pending() -> Rc<Self> {
        Rc::new(Self {
            slot: RefCell::new(Slot::Pending(None)),
        })
    }

    fn ready(result: Result<T>) -> Rc<Self> {
        Rc::new(Self {
            slot: RefCell::new(Slot::Ready(result)),
        })
    }

    /// Deliver the result. The first call wins; later calls return false.
    pub(crate) fn resolve(&self, result: Result<T>) -> bool {
        let waiter = {
            let slot = &mut *self.slot.borrow_mut();

            match slot {
                Slot::Pending(waiter) => {
                    let waiter = waiter.take();
                    *slot = Slot::Ready(result);
                    waiter
                }
                _ => return false,
            }
        };

        if let Some(waiter) = waiter {
            arm_breadth_first(waiter);
        }

        true
    }

    fn is_ready(&self) -> bool {
        matches!(&*self.slot.borrow(), Slot::Ready(_))
    }

    fn set_waiter(&self, event: Weak<dyn Event>) {
        let slot = &mut *self.slot.borrow_mut();

        match slot {
            Slot::Pending(waiter) => *waiter = Some(event),
            Slot::Ready(_) => arm_breadth_first(event),
            Slot::Taken => panic!("promise result was already taken"),
        }
    }

    fn take(&self) -> Result<T> {
        match mem::replace(&mut *self.slot.borrow_mut(), Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Pending(_) => panic!("promise result taken before it was ready"),
            Slot::Taken => panic!("promise result was already taken"),
        }
    }
}

// =======================================================================================
// Promise

/// A value of type `T`, or an [`Exception`], that will become available on
/// the current thread's [`EventLoop`].
///
/// Promises have exactly one consumer. Use [`fork`](Promise::fork) to share
/// a result between several consumers.
pub struct Promise<T> {
    state: Rc<PromiseState<T>>,

    // whatever produces the value. dropping it cancels the work
    owner: Option<Rc<dyn Any>>,
}

impl<T: 'static> Promise<T> {
    pub fn ready(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    pub fn rejected(e: Exception) -> Self {
        Self::from_result(Err(e))
    }

    pub fn from_result(result: Result<T>) -> Self {
        Self {
            state: PromiseState::ready(result),
            owner: None,
        }
    }

    /// A promise that never completes.
    pub fn never() -> Self {
        Self {
            state: PromiseState::pending(),
            owner: None,
        }
    }

    pub(crate) fn with_owner(state: Rc<PromiseState<T>>, owner: Rc<dyn Any>) -> Self {
        Self {
            state,
            owner: Some(owner),
        }
    }

    pub(crate) fn new_state() -> Rc<PromiseState<T>> {
        PromiseState::pending()
    }

    /// Run `f` on a later turn of the event loop.
    pub fn eval_later<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + 'static,
    {
        let state = PromiseState::pending();

        let event = Rc::new(EvalLater {
            link: EventLink::default(),
            f: Cell::new(Some(f)),
            output: Rc::downgrade(&state),
        });

        arm_breadth_first(Rc::downgrade(&event) as Weak<dyn Event>);

        Self::with_owner(state, event)
    }

    /// Create a promise and the fulfiller that completes it.
    pub fn new_paf() -> (Self, PromiseFulfiller<T>) {
        let state = PromiseState::pending();

        let fulfiller = PromiseFulfiller {
            state: Some(Rc::downgrade(&state)),
        };

        (Self { state, owner: None }, fulfiller)
    }

    /// Create a promise that can be fulfilled from any thread.
    ///
    /// # Panics
    ///
    /// Panics if no `EventLoop` is running on this thread.
    pub fn new_cross_thread() -> (Self, CrossThreadFulfiller<T>)
    where
        T: Send,
    {
        let (fulfiller, source) = Executor::current().new_cross_thread_channel();

        (source.into_promise(), fulfiller)
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Run the loop until this promise completes. See [`EventLoop::wait`].
    pub fn wait(self, event_loop: &EventLoop) -> Result<T> {
        event_loop.wait(self)
    }

    /// Arm `event` once the result is available. Replaces any previously
    /// registered event.
    pub(crate) fn on_ready(&self, event: Weak<dyn Event>) {
        self.state.set_waiter(event)
    }

    /// Consume a ready promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise is not ready.
    pub(crate) fn into_ready(self) -> Result<T> {
        self.state.take()
    }

    /// Continue with `f` once the result is available, whether it is a value
    /// or an exception.
    pub fn then_result<U, F>(self, f: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(Result<T>) -> Promise<U> + 'static,
    {
        let state = PromiseState::pending();
        let source = Rc::clone(&self.state);

        let transform = Rc::new(Transform {
            link: EventLink::default(),
            stage: RefCell::new(Stage::Source(self, f)),
            output: Rc::downgrade(&state),
        });

        source.set_waiter(Rc::downgrade(&transform) as Weak<dyn Event>);

        Promise::with_owner(state, transform)
    }

    pub fn then<U, F>(self, f: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        self.then_result(|result| match result {
            Ok(value) => f(value),
            Err(e) => Promise::rejected(e),
        })
    }

    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then_result(|result| Promise::from_result(result.map(f)))
    }

    /// Recover from an exception.
    pub fn catch<F>(self, f: F) -> Self
    where
        F: FnOnce(Exception) -> Result<T> + 'static,
    {
        self.then_result(|result| Promise::from_result(result.or_else(f)))
    }

    /// Share the result between any number of branches.
    pub fn fork(self) -> ForkedPromise<T>
    where
        T: Clone,
    {
        let source = Rc::clone(&self.state);

        let hub = Rc::new(ForkHub {
            link: EventLink::default(),
            source: RefCell::new(Some(self)),
            result: RefCell::new(None),
            branches: RefCell::new(Vec::new()),
        });

        source.set_waiter(Rc::downgrade(&hub) as Weak<dyn Event>);

        ForkedPromise { hub }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.state.is_ready())
            .finish()
    }
}

// =======================================================================================
// Type erasure

pub(crate) trait PromiseNode {
    fn is_ready(&self) -> bool;
    fn on_ready(&self, event: Weak<dyn Event>);
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: 'static> PromiseNode for Promise<T> {
    fn is_ready(&self) -> bool {
        Promise::is_ready(self)
    }

    fn on_ready(&self, event: Weak<dyn Event>) {
        Promise::on_ready(self, event)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A promise with its value type erased, so it can be held by code that is
/// not generic over `T`.
pub struct OwnPromiseNode(Box<dyn PromiseNode>);

impl OwnPromiseNode {
    pub fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    pub(crate) fn on_ready(&self, event: Weak<dyn Event>) {
        self.0.on_ready(event)
    }

    /// Recover the typed promise.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the type the node was created from.
    pub fn into_promise<T: 'static>(self) -> Promise<T> {
        match self.0.into_any().downcast::<Promise<T>>() {
            Ok(p) => *p,
            Err(_) => panic!("OwnPromiseNode does not hold a Promise of the requested type"),
        }
    }
}

impl<T: 'static> From<Promise<T>> for OwnPromiseNode {
    fn from(p: Promise<T>) -> Self {
        Self(Box::new(p))
    }
}

impl fmt::Debug for OwnPromiseNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnPromiseNode")
            .field("ready", &self.is_ready())
            .finish()
    }
}

// =======================================================================================
// Fulfillers

/// Completes the paired [`Promise`]. Dropping it without fulfilling rejects
/// the promise.
pub struct PromiseFulfiller<T> {
    state: Option<Weak<PromiseState<T>>>,
}

impl<T> PromiseFulfiller<T> {
    pub fn fulfill(mut self, value: T) {
        self.complete(Ok(value));
    }

    pub fn reject(mut self, e: Exception) {
        self.complete(Err(e));
    }

    /// Returns false if the promise was dropped, and there is no point in
    /// producing a value anymore.
    pub fn is_waiting(&self) -> bool {
        self.state
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|s| !s.is_ready())
    }

    fn complete(&mut self, result: Result<T>) {
        if let Some(state) = self.state.take().and_then(|s| s.upgrade()) {
            state.resolve(result);
        }
    }
}

impl<T> Drop for PromiseFulfiller<T> {
    fn drop(&mut self) {
        self.complete(Err(Exception::failed(
            "PromiseFulfiller was destroyed without fulfilling the promise",
        )));
    }
}

impl<T> fmt::Debug for PromiseFulfiller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFulfiller")
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

struct CrossThreadShared<T> {
    value: Option<Result<T>>,
    fulfilled: bool,

    // set once the receiving side has registered with the loop
    token: Option<u64>,
}

/// Completes a promise living on another thread's [`EventLoop`]. It can be
/// sent anywhere, and the first call to [`fulfill`](Self::fulfill) or
/// [`reject`](Self::reject) wins. Dropping it unfulfilled rejects the
/// promise.
pub struct CrossThreadFulfiller<T> {
    shared: Arc<Mutex<CrossThreadShared<T>>>,
    executor: Executor,
}

impl<T> CrossThreadFulfiller<T> {
    /// Returns false if the promise was already completed.
    pub fn fulfill(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn reject(&self, e: Exception) -> bool {
        self.complete(Err(e))
    }

    pub fn is_fulfilled(&self) -> bool {
        self.shared.lock().unwrap().fulfilled
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    fn complete(&self, result: Result<T>) -> bool {
        let token = {
            let shared = &mut *self.shared.lock().unwrap();

            if shared.fulfilled {
                return false;
            }

            shared.fulfilled = true;
            shared.value = Some(result);

            shared.token
        };

        if let Some(token) = token {
            self.executor.notify(token);
        }

        true
    }
}

impl<T> Drop for CrossThreadFulfiller<T> {
    fn drop(&mut self) {
        self.complete(Err(Exception::failed(
            "CrossThreadFulfiller was destroyed without fulfilling the promise",
        )));
    }
}

impl<T> fmt::Debug for CrossThreadFulfiller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossThreadFulfiller")
            .field("executor", &self.executor)
            .field("fulfilled", &self.is_fulfilled())
            .finish()
    }
}

/// The receiving half of a cross-thread channel. It can be created and moved
/// on any thread, but must be turned into a promise on the executor's thread.
pub struct CrossThreadSource<T> {
    shared: Arc<Mutex<CrossThreadShared<T>>>,
    executor: Executor,
}

impl<T: 'static> CrossThreadSource<T> {
    /// # Panics
    ///
    /// Panics if called off the executor's thread.
    pub fn into_promise(self) -> Promise<T> {
        assert!(
            self.executor.is_current(),
            "CrossThreadSource::into_promise() called off its executor's thread"
        );

        let state = PromiseState::pending();

        let receiver = Rc::new(CrossThreadReceiver {
            link: EventLink::default(),
            shared: self.shared,
            output: Rc::downgrade(&state),
            token: Cell::new(None),
        });

        {
            let shared = &mut *receiver.shared.lock().unwrap();

            match shared.value.take() {
                Some(result) => {
                    state.resolve(result);
                }
                None => {
                    let token = register_listener(Rc::downgrade(&receiver) as Weak<dyn Event>);
                    receiver.token.set(token);
                    shared.token = token;
                }
            }
        }

        Promise::with_owner(state, receiver)
    }
}

impl<T> fmt::Debug for CrossThreadSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossThreadSource")
            .field("executor", &self.executor)
            .finish()
    }
}

impl Executor {
    /// Create a channel delivering one value onto this executor's loop. May
    /// be called from any thread.
    pub fn new_cross_thread_channel<T>(&self) -> (CrossThreadFulfiller<T>, CrossThreadSource<T>) {
        let shared = Arc::new(Mutex::new(CrossThreadShared {
            value: None,
            fulfilled: false,
            token: None,
        }));

        (
            CrossThreadFulfiller {
                shared: Arc::clone(&shared),
                executor: self.clone(),
            },
            CrossThreadSource {
                shared,
                executor: self.clone(),
            },
        )
    }
}

// =======================================================================================
// Events backing the promise constructors and combinators

struct EvalLater<T, F> {
    link: EventLink,
    f: Cell<Option<F>>,
    output: Weak<PromiseState<T>>,
}

impl<T, F> Event for EvalLater<T, F>
where
    F: FnOnce() -> Result<T>,
{
    fn link(&self) -> &EventLink {
        &self.link
    }

    fn fire(self: Rc<Self>) {
        if let Some(f) = self.f.take() {
            let result = f();

            if let Some(output) = self.output.upgrade() {
                output.resolve(result);
            }
        }
    }
}

enum Stage<T, U, F> {
    Source(Promise<T>, F),
    Inner(Promise<U>),
    Done,
}

struct Transform<T, U, F> {
    link: EventLink,
    stage: RefCell<Stage<T, U, F>>,
    output: Weak<PromiseState<U>>,
}

impl<T, U, F> Transform<T, U, F> {
    fn resolve(&self, result: Result<U>) {
        if let Some(output) = self.output.upgrade() {
            output.resolve(result);
        }
    }
}

impl<T, U, F> Event for Transform<T, U, F>
where
    T: 'static,
    U: 'static,
    F: FnOnce(Result<T>) -> Promise<U> + 'static,
{
    fn link(&self) -> &EventLink {
        &self.link
    }

    fn fire(self: Rc<Self>) {
        let stage = self.stage.replace(Stage::Done);

        match stage {
            Stage::Source(source, f) => {
                let inner = f(source.into_ready());

                if inner.is_ready() {
                    self.resolve(inner.into_ready());
                } else {
                    inner.on_ready(Rc::downgrade(&self) as Weak<dyn Event>);
                    *self.stage.borrow_mut() = Stage::Inner(inner);
                }
            }
            Stage::Inner(inner) => self.resolve(inner.into_ready()),
            Stage::Done => {}
        }
    }
}

struct ForkHub<T> {
    link: EventLink,
    source: RefCell<Option<Promise<T>>>,
    result: RefCell<Option<Result<T>>>,
    branches: RefCell<Vec<Weak<PromiseState<T>>>>,
}

impl<T: Clone + 'static> Event for ForkHub<T> {
    fn link(&self) -> &EventLink {
        &self.link
    }

    fn fire(self: Rc<Self>) {
        let Some(source) = self.source.borrow_mut().take() else {
            return;
        };

        let result = source.into_ready();
        let branches = mem::take(&mut *self.branches.borrow_mut());

        trace!("fork resolved, {} live branches", branches.len());

        for branch in branches {
            if let Some(branch) = branch.upgrade() {
                branch.resolve(result.clone());
            }
        }

        *self.result.borrow_mut() = Some(result);
    }
}

/// A promise whose result can be observed by any number of branches,
/// including branches added after it completed.
pub struct ForkedPromise<T> {
    hub: Rc<ForkHub<T>>,
}

impl<T: Clone + 'static> ForkedPromise<T> {
    pub fn add_branch(&self) -> Promise<T> {
        let state = PromiseState::pending();

        match &*self.hub.result.borrow() {
            Some(result) => {
                state.resolve(result.clone());
            }
            None => self.hub.branches.borrow_mut().push(Rc::downgrade(&state)),
        }

        Promise::with_owner(state, Rc::clone(&self.hub) as Rc<dyn Any>)
    }

    pub fn is_ready(&self) -> bool {
        self.hub.result.borrow().is_some()
    }
}

impl<T> fmt::Debug for ForkedPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkedPromise")
            .field("ready", &self.hub.result.borrow().is_some())
            .finish()
    }
}

struct CrossThreadReceiver<T> {
    link: EventLink,
    shared: Arc<Mutex<CrossThreadShared<T>>>,
    output: Weak<PromiseState<T>>,
    token: Cell<Option<u64>>,
}

impl<T> Event for CrossThreadReceiver<T> {
    fn link(&self) -> &EventLink {
        &self.link
    }

    fn fire(self: Rc<Self>) {
        let Some(result) = self.shared.lock().unwrap().value.take() else {
            return;
        };

        if let Some(token) = self.token.take() {
            unregister_listener(token);
        }

        if let Some(output) = self.output.upgrade() {
            output.resolve(result);
        }
    }
}

impl<T> Drop for CrossThreadReceiver<T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            unregister_listener(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExceptionKind;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ready() {
        let event_loop = EventLoop::new();

        assert!(Promise::ready(1).is_ready());
        assert_eq!(Promise::ready(1).wait(&event_loop), Ok(1));

        let e = Promise::<()>::rejected(Exception::failed("nope"))
            .wait(&event_loop)
            .unwrap_err();
        assert_eq!(e.description(), "nope");
    }

    #[test]
    fn test_paf() {
        let event_loop = EventLoop::new();

        let (p, fulfiller) = Promise::new_paf();
        assert!(!p.is_ready());
        assert!(fulfiller.is_waiting());

        fulfiller.fulfill("hello");
        assert!(p.is_ready());
        assert_eq!(p.wait(&event_loop), Ok("hello"));
    }

    #[test]
    fn test_fulfiller_dropped() {
        let event_loop = EventLoop::new();

        let (p, fulfiller) = Promise::<u32>::new_paf();
        drop(fulfiller);

        let e = p.wait(&event_loop).unwrap_err();
        assert_eq!(e.kind(), ExceptionKind::Failed);
    }

    #[test]
    fn test_fulfiller_sees_cancel() {
        let _event_loop = EventLoop::new();

        let (p, fulfiller) = Promise::<u32>::new_paf();
        drop(p);

        assert!(!fulfiller.is_waiting());
        fulfiller.fulfill(1);
    }

    #[test]
    fn test_combinators() {
        let event_loop = EventLoop::new();

        let (p, fulfiller) = Promise::new_paf();

        let p = p
            .map(|x: u32| x + 1)
            .then(|x| Promise::eval_later(move || Ok(x * 10)))
            .then(|_| Promise::<u32>::rejected(Exception::failed("boom")))
            .catch(|e| {
                assert_eq!(e.description(), "boom");
                Ok(7)
            });

        fulfiller.fulfill(1);
        assert_eq!(p.wait(&event_loop), Ok(7));
    }

    #[test]
    fn test_then_passes_value() {
        let event_loop = EventLoop::new();

        let p = Promise::eval_later(|| Ok(2))
            .then(|x| Promise::eval_later(move || Ok(x * 10)))
            .map(|x| x + 1);

        assert_eq!(p.wait(&event_loop), Ok(21));
    }

    #[test]
    fn test_drop_cancels() {
        let event_loop = EventLoop::new();

        let ran = Rc::new(Cell::new(false));

        let (p, fulfiller) = Promise::new_paf();
        let p = {
            let ran = Rc::clone(&ran);
            p.map(move |()| ran.set(true))
        };

        drop(p);
        assert!(!fulfiller.is_waiting());

        fulfiller.fulfill(());
        event_loop.run();
        assert!(!ran.get());
    }

    #[test]
    fn test_fork() {
        let event_loop = EventLoop::new();

        let (p, fulfiller) = Promise::new_paf();
        let forked = p.fork();

        let a = forked.add_branch();
        let b = forked.add_branch();
        drop(forked.add_branch());

        fulfiller.fulfill(5);
        assert_eq!(a.wait(&event_loop), Ok(5));
        assert_eq!(b.wait(&event_loop), Ok(5));
        assert!(forked.is_ready());

        // late branch
        assert_eq!(forked.add_branch().wait(&event_loop), Ok(5));
    }

    #[test]
    fn test_own_promise_node() {
        let event_loop = EventLoop::new();

        let node = OwnPromiseNode::from(Promise::ready(String::from("x")));
        assert!(node.is_ready());

        let p: Promise<String> = node.into_promise();
        assert_eq!(p.wait(&event_loop), Ok(String::from("x")));
    }

    #[test]
    #[should_panic(expected = "requested type")]
    fn test_own_promise_node_wrong_type() {
        let _event_loop = EventLoop::new();

        let node = OwnPromiseNode::from(Promise::ready(1u8));
        let _: Promise<u16> = node.into_promise();
    }

    #[test]
    fn test_cross_thread() {
        let event_loop = EventLoop::new();

        let (p, fulfiller) = Promise::new_cross_thread();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(fulfiller.fulfill(42));
            assert!(!fulfiller.fulfill(43));
        });

        assert_eq!(p.wait(&event_loop), Ok(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_cross_thread_fulfilled_before_receive() {
        let event_loop = EventLoop::new();

        let (fulfiller, source) = event_loop.executor().new_cross_thread_channel();

        thread::spawn(move || fulfiller.fulfill(1)).join().unwrap();

        let p = source.into_promise();
        assert!(p.is_ready());
        assert_eq!(p.wait(&event_loop), Ok(1));
    }

    #[test]
    fn test_cross_thread_fulfiller_dropped() {
        let event_loop = EventLoop::new();

        let (p, fulfiller) = Promise::<u32>::new_cross_thread();

        thread::spawn(move || drop(fulfiller));

        let e = p.wait(&event_loop).unwrap_err();
        assert_eq!(e.kind(), ExceptionKind::Failed);
    }
}
