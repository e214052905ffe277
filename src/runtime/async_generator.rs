use std::cell::RefCell;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use crate::error::Result;

// Rendezvous states. The consumer advancing flips the word to
// VALUE_NOT_READY and resumes the producer; the producer parks on a yield
// with the slot filled and the word at VALUE_READY. Release pairs with
// acquire across the handoff. Cancellation is terminal.
const VALUE_NOT_READY: u8 = 0;
const VALUE_READY: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

struct Rendezvous<T> {
    state: AtomicU8,
    slot: RefCell<Option<T>>,
}

impl<T> Rendezvous<T> {
    fn put(&self, value: T) {
        let previous = self.slot.borrow_mut().replace(value);
        debug_assert!(previous.is_none(), "yield over an unconsumed value");
    }

    fn take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

/// A lazy asynchronous producer/consumer sequence.
///
/// The producer coroutine runs only while the consumer advances; a
/// successful yield leaves the producer parked until the next advance, so
/// it can never run ahead of an unconsumed value. Dropping the generator
/// cancels: the rendezvous flips to its terminal state and the producer
/// frame is destroyed, either immediately (parked at a yield) or never
/// resumed again. A producer failure surfaces on the advance that would
/// have produced the next value; after cancellation it is discarded with
/// the frame.
pub struct AsyncGenerator<'a, T> {
    shared: Rc<Rendezvous<T>>,
    future: Option<Pin<Box<dyn Future<Output = Result<()>> + 'a>>>,
}

/// Creates an [`AsyncGenerator`] from a producer closure.
///
/// The closure receives the [`YieldHandle`] the producer yields through:
///
/// ```no_run
/// use corio::runtime::async_generator;
///
/// let mut numbers = async_generator(|y| async move {
///     for i in 0..3 {
///         y.value(i).await;
///     }
///     Ok(())
/// });
/// ```
pub fn async_generator<'a, T, F, Fut>(producer: F) -> AsyncGenerator<'a, T>
where
    T: 'a,
    F: FnOnce(YieldHandle<T>) -> Fut,
    Fut: Future<Output = Result<()>> + 'a,
{
    let shared = Rc::new(Rendezvous {
        state: AtomicU8::new(VALUE_NOT_READY),
        slot: RefCell::new(None),
    });
    let future = producer(YieldHandle {
        shared: shared.clone(),
    });
    AsyncGenerator {
        shared,
        future: Some(Box::pin(future)),
    }
}

enum Step<T> {
    Value(T),
    Finished(Result<()>),
}

impl<T> AsyncGenerator<'_, T> {
    /// Resumes the producer until it yields the next value or finishes.
    pub async fn next(&mut self) -> Result<Option<T>> {
        let shared = self.shared.clone();
        let step = {
            let Some(future) = self.future.as_mut() else {
                return Ok(None);
            };
            shared.state.store(VALUE_NOT_READY, Ordering::Release);
            poll_fn(|cx| match future.as_mut().poll(cx) {
                Poll::Ready(result) => Poll::Ready(Step::Finished(result)),
                Poll::Pending => {
                    if shared.state.load(Ordering::Acquire) == VALUE_READY {
                        match shared.take() {
                            Some(value) => Poll::Ready(Step::Value(value)),
                            None => Poll::Pending,
                        }
                    } else {
                        Poll::Pending
                    }
                }
            })
            .await
        };
        match step {
            Step::Value(value) => Ok(Some(value)),
            Step::Finished(result) => {
                shared.state.store(DONE, Ordering::Release);
                self.future = None;
                result.map(|()| None)
            }
        }
    }
}

impl<T> Drop for AsyncGenerator<'_, T> {
    fn drop(&mut self) {
        // The producer observes the terminal state through its frame being
        // destroyed; a producer parked at a yield goes down right here.
        self.shared.state.store(CANCELLED, Ordering::Release);
        self.future = None;
    }
}

impl<T> std::fmt::Debug for AsyncGenerator<'_, T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("AsyncGenerator")
            .field("finished", &self.future.is_none())
            .finish()
    }
}

/// Producer-side handle of an [`AsyncGenerator`].
pub struct YieldHandle<T> {
    shared: Rc<Rendezvous<T>>,
}

impl<T> YieldHandle<T> {
    /// Hands `value` to the consumer and suspends until the next advance.
    pub fn value(&self, value: T) -> YieldValue<'_, T> {
        YieldValue {
            shared: &self.shared,
            value: Some(value),
        }
    }
}

impl<T> std::fmt::Debug for YieldHandle<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("YieldHandle").finish()
    }
}

/// Future of [`YieldHandle::value`].
pub struct YieldValue<'a, T> {
    shared: &'a Rc<Rendezvous<T>>,
    value: Option<T>,
}

impl<T> Future for YieldValue<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: no field is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        match this.value.take() {
            Some(value) => {
                this.shared.put(value);
                this.shared.state.store(VALUE_READY, Ordering::Release);
                Poll::Pending
            }
            // Resumed by the next advance once the value was consumed.
            None => match this.shared.state.load(Ordering::Acquire) {
                VALUE_NOT_READY => Poll::Ready(()),
                _ => Poll::Pending,
            },
        }
    }
}

impl<T> std::fmt::Debug for YieldValue<'_, T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("YieldValue").finish_non_exhaustive()
    }
}
