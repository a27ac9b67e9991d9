//! Futures exercising the different ways a task can treat its waker.

use std::future::{poll_fn, Future};
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Exception, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloningAction {
    None,
    CloneSameThread,
    CloneBackgroundThread,
    WakeByRefThenCloneSameThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakingAction {
    None,
    WakeByRefSameThread,
    WakeByRefBackgroundThread,
    WakeSameThread,
    WakeBackgroundThread,
}

/// Run `f` on another thread and return its result.
pub(crate) fn on_background_thread<T: Send>(f: impl FnOnce() -> T + Send) -> T {
    thread::scope(|s| s.spawn(f).join().unwrap())
}

fn wake_without_clone(waker: &Waker, action: WakingAction) {
    match action {
        WakingAction::None => {}
        WakingAction::WakeByRefSameThread => waker.wake_by_ref(),
        WakingAction::WakeByRefBackgroundThread => on_background_thread(|| waker.wake_by_ref()),
        WakingAction::WakeSameThread | WakingAction::WakeBackgroundThread => {
            panic!("cannot wake() without cloning")
        }
    }
}

fn wake_clone(waker: Waker, action: WakingAction) {
    match action {
        WakingAction::None => {}
        WakingAction::WakeByRefSameThread => waker.wake_by_ref(),
        WakingAction::WakeByRefBackgroundThread => on_background_thread(|| waker.wake_by_ref()),
        WakingAction::WakeSameThread => waker.wake(),
        WakingAction::WakeBackgroundThread => on_background_thread(move || waker.wake()),
    }
}

/// Returns `Pending` on the first poll after doing something to its waker,
/// and `Ready` on the second.
pub(crate) struct WakingFuture {
    done: bool,
    cloning: CloningAction,
    waking: WakingAction,
}

impl WakingFuture {
    pub(crate) fn new(cloning: CloningAction, waking: WakingAction) -> Self {
        Self {
            done: false,
            cloning,
            waking,
        }
    }
}

impl Future for WakingFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(());
        }

        let waker = cx.waker();

        match self.cloning {
            CloningAction::None => wake_without_clone(waker, self.waking),
            CloningAction::CloneSameThread => wake_clone(waker.clone(), self.waking),
            CloningAction::CloneBackgroundThread => {
                let cloned = on_background_thread(|| waker.clone());
                wake_clone(cloned, self.waking);
            }
            CloningAction::WakeByRefThenCloneSameThread => {
                waker.wake_by_ref();
                wake_clone(waker.clone(), self.waking);
            }
        }

        self.done = true;

        Poll::Pending
    }
}

/// Clones its waker from a background thread, then wakes it from another
/// thread after a delay.
pub(crate) struct ThreadedDelayFuture {
    delay: Duration,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedDelayFuture {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            handle: None,
        }
    }
}

impl Future for ThreadedDelayFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();

            return Poll::Ready(());
        }

        let waker = cx.waker();
        let waker = on_background_thread(|| waker.clone());
        let delay = self.delay;

        self.handle = Some(thread::spawn(move || {
            thread::sleep(delay);
            waker.wake();
        }));

        Poll::Pending
    }
}

/// Resolves with whichever of `a` or `b` is ready first.
pub(crate) fn naive_select<T>(
    a: impl Future<Output = T> + Send,
    b: impl Future<Output = T> + Send,
) -> impl Future<Output = T> + Send {
    async {
        let (mut a, mut b) = (pin!(a), pin!(b));

        poll_fn(move |cx| {
            if let Poll::Ready(r) = a.as_mut().poll(cx) {
                Poll::Ready(r)
            } else if let Poll::Ready(r) = b.as_mut().poll(cx) {
                Poll::Ready(r)
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

pub(crate) fn errored_future() -> impl Future<Output = Result<()>> + Send {
    async { Err(Exception::failed("test error")) }
}

/// Forwards to another waker, hiding what kind of waker it is.
pub(crate) struct WrappedWaker(Waker);

impl Wake for WrappedWaker {
    fn wake(self: Arc<Self>) {
        self.0.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.wake_by_ref()
    }
}

/// Polls the inner future with a [`WrappedWaker`].
pub(crate) struct WithWrappedWaker<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> WithWrappedWaker<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for WithWrappedWaker<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let waker = Waker::from(Arc::new(WrappedWaker(cx.waker().clone())));
        let mut cx = Context::from_waker(&waker);

        self.inner.as_mut().poll(&mut cx)
    }
}
