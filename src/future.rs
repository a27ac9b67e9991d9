use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::ptr;
use std::task::{Context, Poll, Waker};

use static_assertions::assert_eq_size;

use crate::error::{Exception, Result};
use crate::waker::ThreadAffineWaker;

pub struct BoxFutureVTable<T> {
    poll: unsafe fn(*mut (), &mut Context<'_>) -> Poll<T>,
    drop: unsafe fn(*mut ()),
}

/// An owned, type-erased future, exactly two machine words wide: a pointer
/// to the heap-allocated future and a pointer to the poll and drop entry
/// points generated for its concrete type.
///
/// Moving out with [`take`](Self::take) leaves both words null. Dropping an
/// emptied `BoxFuture` does nothing, so the concrete future is dropped
/// exactly once however many times the handle moves.
#[repr(C)]
pub struct BoxFuture<T: 'static> {
    data: *mut (),
    vtable: *const BoxFutureVTable<T>,
}

assert_eq_size!(BoxFuture<()>, [usize; 2]);
assert_eq_size!(BoxFuture<Result<String>>, [usize; 2]);

impl<T: 'static> BoxFuture<T> {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            data: Box::into_raw(Box::new(fut)) as *mut (),
            vtable: vtable::<F>(),
        }
    }

    pub const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            vtable: ptr::null(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_null()
    }

    /// Move the future out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        mem::replace(self, Self::empty())
    }
}

#[inline(always)]
fn vtable<F>() -> &'static BoxFutureVTable<F::Output>
where
    F: Future + Send + 'static,
{
    struct VTablePerType<F>(F);

    impl<F: Future + Send + 'static> VTablePerType<F> {
        const VTABLE: &'static BoxFutureVTable<F::Output> = &BoxFutureVTable {
            poll: poll_fn::<F>,
            drop: drop_fn::<F>,
        };
    }

    unsafe fn poll_fn<F: Future + Send + 'static>(
        data: *mut (),
        cx: &mut Context<'_>,
    ) -> Poll<F::Output> {
        // SAFETY: data came from Box::into_raw and is never moved
        let fut = unsafe { Pin::new_unchecked(&mut *(data as *mut F)) };

        fut.poll(cx)
    }

    unsafe fn drop_fn<F: Future + Send + 'static>(data: *mut ()) {
        drop(unsafe { Box::from_raw(data as *mut F) });
    }

    VTablePerType::<F>::VTABLE
}

impl<T: 'static> Future for BoxFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        assert!(!self.is_empty(), "polled an empty BoxFuture");

        // SAFETY: non-empty, so data and vtable were set together by new()
        unsafe { ((*self.vtable).poll)(self.data, cx) }
    }
}

impl<T: 'static> Drop for BoxFuture<T> {
    fn drop(&mut self) {
        if !self.is_empty() {
            // SAFETY: non-empty, so data and vtable were set together by new()
            unsafe { ((*self.vtable).drop)(self.data) };
        }
    }
}

impl<T: 'static> Default for BoxFuture<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: 'static> fmt::Debug for BoxFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxFuture")
            .field("empty", &self.is_empty())
            .finish()
    }
}

// SAFETY: new() only accepts Send futures
unsafe impl<T: 'static> Send for BoxFuture<T> {}

/// A type a [`BoxFuture`] may resolve to.
///
/// Fallible outputs (`Result<V, E>` for any `E: Into<Exception>`) surface
/// their errors as exceptions. Other output types are registered with
/// [`infallible_future_output!`](crate::infallible_future_output).
pub trait FutureOutput: 'static {
    type Value: 'static;

    const FALLIBLE: bool;

    fn into_result(self) -> Result<Self::Value>;
}

/// Register types as infallible [`FutureOutput`]s.
///
/// ```
/// struct Reply(u32);
///
/// promise_waker::infallible_future_output!(Reply);
/// ```
#[macro_export]
macro_rules! infallible_future_output {
    ($($t:ty),* $(,)?) => {
        $(
            impl $crate::FutureOutput for $t {
                type Value = $t;

                const FALLIBLE: bool = false;

                fn into_result(self) -> $crate::Result<$t> {
                    Ok(self)
                }
            }
        )*
    };
}

infallible_future_output!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    usize,
    isize,
    f32,
    f64,
    String,
    Vec<u8>,
);

impl<T, E> FutureOutput for std::result::Result<T, E>
where
    T: 'static,
    E: Into<Exception> + 'static,
{
    type Value = T;

    const FALLIBLE: bool = true;

    fn into_result(self) -> Result<T> {
        self.map_err(Into::into)
    }
}

/// Receives the value of a completed [`BoxFuture`].
pub trait Fulfill<T> {
    fn fulfill(&mut self, value: T);
}

impl<T> Fulfill<T> for Option<T> {
    fn fulfill(&mut self, value: T) {
        assert!(self.is_none(), "fulfilled twice");

        *self = Some(value);
    }
}

/// Poll `fut` once with a waker lent from `waker`. On completion the value
/// goes to `fulfill` and `Ok(true)` is returned. A fallible future that
/// resolved to an error returns `Err` instead, and `fulfill` is not called.
///
/// The future must not be polled again after it completes.
///
/// # Panics
///
/// Panics, before the future is polled, if called off `waker`'s executor
/// thread.
pub fn box_future_poll<T, F>(
    fut: &mut BoxFuture<T>,
    waker: &ThreadAffineWaker,
    fulfill: &mut F,
) -> Result<bool>
where
    T: FutureOutput,
    F: Fulfill<T::Value>,
{
    assert!(
        waker.executor().is_current(),
        "box_future_poll() called off the waker's executor thread"
    );

    let lent = waker.lend();

    box_future_poll_with_waker(fut, &lent, fulfill)
}

/// Like [`box_future_poll`], with an arbitrary waker.
///
/// # Panics
///
/// Panics, before the future is polled, if `waker` was lent by a
/// [`ThreadAffineWaker`] belonging to another thread's executor.
pub fn box_future_poll_with_waker<T, F>(
    fut: &mut BoxFuture<T>,
    waker: &Waker,
    fulfill: &mut F,
) -> Result<bool>
where
    T: FutureOutput,
    F: Fulfill<T::Value>,
{
    ThreadAffineWaker::assert_usable_from(waker);

    let mut cx = Context::from_waker(waker);

    match Pin::new(fut).poll(&mut cx) {
        Poll::Ready(output) => {
            fulfill.fulfill(output.into_result()?);

            Ok(true)
        }
        Poll::Pending => Ok(false),
    }
}

/// Drop the `BoxFuture` at `fut` in place, leaving it empty.
///
/// # Safety
///
/// `fut` must point to a valid, initialized `BoxFuture`.
pub unsafe fn box_future_drop_in_place<T: 'static>(fut: *mut BoxFuture<T>) {
    // SAFETY: guaranteed by the caller
    let fut = unsafe { &mut *fut };

    drop(fut.take());
}
