use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

/// A lazy synchronous sequence.
///
/// The producer is a future that only ever suspends at its own
/// [`YieldPoint`]; each [`Iterator::next`] resumes it until it yields or
/// returns. Suspending on anything else (a socket, an event, another
/// generator) is refused with a panic: a synchronous generator has no
/// loop underneath it to come back.
///
/// ```
/// use corio::runtime::generator;
///
/// let counter = generator(|yield_point| async move {
///     for i in 0..3 {
///         yield_point.value(i).await;
///     }
/// });
/// assert_eq!(counter.collect::<Vec<_>>(), vec![0, 1, 2]);
/// ```
pub struct Generator<'a, T> {
    slot: Rc<RefCell<Option<T>>>,
    future: Option<Pin<Box<dyn Future<Output = ()> + 'a>>>,
}

/// Creates a [`Generator`] from a producer closure.
pub fn generator<'a, T, F, Fut>(producer: F) -> Generator<'a, T>
where
    T: 'a,
    F: FnOnce(YieldPoint<T>) -> Fut,
    Fut: Future<Output = ()> + 'a,
{
    let slot = Rc::new(RefCell::new(None));
    let future = producer(YieldPoint { slot: slot.clone() });
    Generator {
        slot,
        future: Some(Box::pin(future)),
    }
}

impl<T> Iterator for Generator<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let future = self.future.as_mut()?;
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.future = None;
                None
            }
            Poll::Pending => match self.slot.borrow_mut().take() {
                Some(value) => Some(value),
                None => panic!("synchronous generator suspended on a foreign future"),
            },
        }
    }
}

impl<T> std::fmt::Debug for Generator<'_, T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Generator")
            .field("finished", &self.future.is_none())
            .finish()
    }
}

/// Producer-side handle of a [`Generator`].
pub struct YieldPoint<T> {
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> YieldPoint<T> {
    /// Hands `value` to the consumer and suspends until the next advance.
    pub fn value(&self, value: T) -> YieldValue<'_, T> {
        YieldValue {
            slot: &self.slot,
            value: Some(value),
        }
    }
}

impl<T> std::fmt::Debug for YieldPoint<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("YieldPoint").finish()
    }
}

/// Future of [`YieldPoint::value`]: pending once with the value parked,
/// ready when resumed by the next advance.
pub struct YieldValue<'a, T> {
    slot: &'a Rc<RefCell<Option<T>>>,
    value: Option<T>,
}

impl<T> Future for YieldValue<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: no self-referential fields; moving the value out is fine.
        let this = unsafe { self.get_unchecked_mut() };
        match this.value.take() {
            Some(value) => {
                *this.slot.borrow_mut() = Some(value);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

impl<T> std::fmt::Debug for YieldValue<'_, T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("YieldValue").finish_non_exhaustive()
    }
}

fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable =
        RawWakerVTable::new(|_| RawWaker::new(std::ptr::null(), &VTABLE), |_| {}, |_| {}, |_| {});
    // SAFETY: every vtable entry is a no-op.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_in_order_then_ends() {
        let mut numbers = generator(|y| async move {
            y.value(1).await;
            y.value(2).await;
        });
        assert_eq!(numbers.next(), Some(1));
        assert_eq!(numbers.next(), Some(2));
        assert_eq!(numbers.next(), None);
        assert_eq!(numbers.next(), None);
    }

    #[test]
    fn body_runs_lazily() {
        use std::cell::Cell;
        use std::rc::Rc;

        let started = Rc::new(Cell::new(false));
        let flag = started.clone();
        let mut gen = generator(move |y| async move {
            flag.set(true);
            y.value(0u8).await;
        });
        assert!(!started.get());
        assert_eq!(gen.next(), Some(0));
        assert!(started.get());
    }

    #[test]
    #[should_panic(expected = "foreign future")]
    fn refuses_foreign_suspension() {
        let mut gen: Generator<'_, u8> = generator(|_y| async move {
            std::future::pending::<()>().await;
        });
        let _ = gen.next();
    }
}
