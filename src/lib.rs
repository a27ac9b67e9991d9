//! This library lets poll-based futures and a continuation-based promise event loop await each other, in both directions, within one process.
//!
//! There are two integration points:
//! - A future can be run on the event loop by boxing it into a [`BoxFuture`] and calling [`BoxFuture::into_promise`] (or [`Promise::from_future`]). The resulting promise completes with the future's output. Dropping the promise cancels the future.
//! - A future can wait on a [`Promise`] by awaiting it, since `Promise<T>` implements [`IntoFuture`](std::future::IntoFuture).
//!
//! The event loop is single-threaded. Futures run on it are polled with a [`ThreadAffineWaker`], which is cheap when used from the loop's own thread: synchronous wakes are just counted, and promises awaited inside the future attach directly to the future's driver instead of cloning the waker. Cloning the waker, which is needed to wake from other threads, lazily allocates a [`CrossThreadSignal`].
//!
//! Continuation-model state is not thread-safe. Poll-based code that needs to hold it inside a `Send` future can wrap it in [`ExecutorGuarded`], which checks the thread on every access.
//!
//! # Example of running a future that awaits a promise
//!
//! ```
//! # use std::future::IntoFuture;
//! # use promise_waker::{EventLoop, Promise};
//! let event_loop = EventLoop::new();
//!
//! let (promise, fulfiller) = Promise::<u32>::new_paf();
//!
//! // Promises aren't Send, so convert before moving into the future
//! let fut = promise.into_future();
//!
//! let doubled = Promise::from_future(async move { fut.await.map(|v| v * 2) });
//!
//! fulfiller.fulfill(21);
//!
//! assert_eq!(doubled.wait(&event_loop), Ok(42));
//! ```
//!
//! # Example of a future woken from another thread
//!
//! ```
//! # use std::future::Future;
//! # use std::pin::Pin;
//! # use std::sync::{Arc, Mutex};
//! # use std::task::{Context, Poll};
//! # use std::thread;
//! # use promise_waker::{EventLoop, Promise};
//! #[derive(Default)]
//! struct Shared {
//!     value: Option<u32>,
//!     started: bool,
//! }
//!
//! struct FromThread(Arc<Mutex<Shared>>);
//!
//! impl Future for FromThread {
//!     type Output = u32;
//!
//!     fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
//!         let shared = &mut *self.0.lock().unwrap();
//!
//!         if let Some(value) = shared.value {
//!             return Poll::Ready(value);
//!         }
//!
//!         if !shared.started {
//!             shared.started = true;
//!
//!             let waker = cx.waker().clone();
//!             let state = Arc::clone(&self.0);
//!
//!             thread::spawn(move || {
//!                 state.lock().unwrap().value = Some(7);
//!                 waker.wake();
//!             });
//!         }
//!
//!         Poll::Pending
//!     }
//! }
//!
//! let event_loop = EventLoop::new();
//!
//! let promise = Promise::from_future(FromThread(Arc::default()));
//!
//! assert_eq!(promise.wait(&event_loop), Ok(7));
//! ```

mod awaiter;
mod driver;
mod error;
mod event_loop;
mod future;
mod linked_group;
mod promise;
mod waker;

#[cfg(test)]
mod test_futures;

pub use awaiter::{PromiseAwaiter, PromiseFuture};
pub use error::{Exception, ExceptionKind, Result};
pub use event_loop::{Builder, EventLoop, Executor, ExecutorGuarded};
pub use future::{
    box_future_drop_in_place, box_future_poll, box_future_poll_with_waker, BoxFuture,
    BoxFutureVTable, Fulfill, FutureOutput,
};
pub use linked_group::{HasLinkedGroup, HasLinkedObject, LinkedGroup, LinkedObject};
pub use promise::{
    CrossThreadFulfiller, CrossThreadSource, ForkedPromise, OwnPromiseNode, Promise,
    PromiseFulfiller,
};
pub use waker::{CrossThreadSignal, LentWaker, ThreadAffineWaker, WakeInstruction, WakerState};
