use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::service::TaskCell;

// Completion handoff states. The producer (the running coroutine) and the
// consumer (the handle awaiting it) each announce themselves with a swap;
// whoever arrives second performs the handoff. Release on completion pairs
// with acquire on attach.
const EMPTY: u8 = 0;
const WAITING: u8 = 1;
const COMPLETE: u8 = 2;
const TAKEN: u8 = 3;

/// Shared slot between a spawned coroutine and its [`Task`] handle.
pub(crate) struct JoinCell<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<Result<T>>>,
    waker: UnsafeCell<Option<Waker>>,
}

impl<T> JoinCell<T> {
    pub(crate) fn new() -> Rc<JoinCell<T>> {
        Rc::new(JoinCell {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(None),
            waker: UnsafeCell::new(None),
        })
    }

    /// Producer side: store the outcome and resume the awaiter if one is
    /// already attached.
    pub(crate) fn complete(&self, value: Result<T>) {
        // SAFETY: the cell is confined to one thread; the value slot is
        // only written here and only read after `state` says COMPLETE.
        unsafe { *self.value.get() = Some(value) };
        if self.state.swap(COMPLETE, Ordering::AcqRel) == WAITING {
            // SAFETY: WAITING guarantees the consumer parked a waker.
            if let Some(waker) = unsafe { (*self.waker.get()).take() } {
                waker.wake();
            }
        }
    }

    fn take(&self) -> Result<T> {
        self.state.store(TAKEN, Ordering::Release);
        // SAFETY: COMPLETE was observed with acquire ordering, the value
        // slot is populated and no longer touched by the producer.
        match unsafe { (*self.value.get()).take() } {
            Some(value) => value,
            None => Err(Error::BrokenPromise),
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match self.state.load(Ordering::Acquire) {
            COMPLETE => Poll::Ready(self.take()),
            TAKEN => panic!("task awaited more than once"),
            _ => {
                // SAFETY: single consumer, single thread; the producer
                // only reads the waker slot after winning the swap below.
                unsafe { *self.waker.get() = Some(cx.waker().clone()) };
                if self.state.swap(WAITING, Ordering::AcqRel) == COMPLETE {
                    // The coroutine finished between the load and the
                    // swap; take the value without suspending.
                    Poll::Ready(self.take())
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn try_take(&self) -> Option<Result<T>> {
        if self.state.load(Ordering::Acquire) == COMPLETE {
            Some(self.take())
        } else {
            None
        }
    }

    fn is_pending(&self) -> bool {
        !matches!(self.state.load(Ordering::Acquire), COMPLETE | TAKEN)
    }
}

/// Disarms when the coroutine runs to completion; firing on drop means the
/// coroutine frame was destroyed first and the handle observes a broken
/// promise.
pub(crate) struct CompletionGuard<T> {
    cell: Rc<JoinCell<T>>,
    armed: Cell<bool>,
}

impl<T> CompletionGuard<T> {
    pub(crate) fn new(cell: Rc<JoinCell<T>>) -> CompletionGuard<T> {
        CompletionGuard {
            cell,
            armed: Cell::new(true),
        }
    }

    pub(crate) fn complete(&self, value: Result<T>) {
        self.armed.set(false);
        self.cell.complete(value);
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if self.armed.get() {
            self.cell.complete(Err(Error::BrokenPromise));
        }
    }
}

/// Handle to a coroutine spawned on a [`Service`].
///
/// Awaiting the handle yields the coroutine's value or its stored failure;
/// a coroutine whose frame was destroyed before completing reports
/// [`Error::BrokenPromise`]. The handle owns the coroutine: dropping it
/// cancels the coroutine, [`detach`] releases it to run unobserved.
/// Awaiting a handle twice is a contract violation and panics.
///
/// [`Service`]: crate::Service
/// [`detach`]: Task::detach
pub struct Task<T> {
    cell: Rc<JoinCell<T>>,
    task: Rc<TaskCell>,
}

impl<T> Task<T> {
    pub(crate) fn new(cell: Rc<JoinCell<T>>, task: Rc<TaskCell>) -> Task<T> {
        Task { cell, task }
    }

    /// Releases the coroutine to run to completion without an awaiter.
    pub fn detach(self) {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `Drop` is suppressed, each field is moved out exactly
        // once and dropped here without running the cancel path.
        unsafe {
            drop(std::ptr::read(&this.cell));
            drop(std::ptr::read(&this.task));
        }
    }

    pub(crate) fn try_take(&self) -> Option<Result<T>> {
        self.cell.try_take()
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        self.cell.poll_take(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.cell.is_pending() {
            // Destroy the coroutine frame; the completion guard inside it
            // marks the cell broken for anyone who raced us.
            self.task.cancel();
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Task").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{RawWaker, RawWakerVTable};

    fn noop_waker() -> Waker {
        const VTABLE: RawWakerVTable = RawWakerVTable::new(
            |_| RawWaker::new(std::ptr::null(), &VTABLE),
            |_| {},
            |_| {},
            |_| {},
        );
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    #[test]
    fn complete_before_attach_hands_off_without_suspending() {
        let cell = JoinCell::new();
        cell.complete(Ok(7));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match cell.poll_take(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 7),
            other => panic!("unexpected poll result: {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn attach_before_complete_suspends_once() {
        let cell = JoinCell::<u8>::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(cell.poll_take(&mut cx).is_pending());
        cell.complete(Ok(3));
        match cell.poll_take(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 3),
            _ => panic!("completion not observed"),
        }
    }

    #[test]
    fn dropped_coroutine_breaks_the_promise() {
        let cell = JoinCell::<u8>::new();
        let guard = CompletionGuard::new(cell.clone());
        drop(guard);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match cell.poll_take(&mut cx) {
            Poll::Ready(Err(Error::BrokenPromise)) => {}
            _ => panic!("expected a broken promise"),
        }
    }

    #[test]
    #[should_panic(expected = "awaited more than once")]
    fn second_await_is_refused() {
        let cell = JoinCell::new();
        cell.complete(Ok(1));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = cell.poll_take(&mut cx);
        let _ = cell.poll_take(&mut cx);
    }
}
