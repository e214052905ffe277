use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    NotSet,
    /// Not set, with the single consumer parked on it.
    Waiting,
    Set,
}

/// A single-consumer event.
///
/// At most one coroutine may wait on it. `set` while the consumer is
/// parked resumes it; `set` with nobody waiting is remembered (and
/// idempotent). Only the consumer side may `reset`.
#[derive(Debug)]
pub struct Event {
    state: Cell<State>,
    waker: RefCell<Option<Waker>>,
}

impl Event {
    pub fn new() -> Event {
        Event {
            state: Cell::new(State::NotSet),
            waker: RefCell::new(None),
        }
    }

    /// Signals the event, resuming the parked consumer if there is one.
    pub fn set(&self) {
        let previous = self.state.replace(State::Set);
        if previous == State::Waiting {
            if let Some(waker) = self.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    /// Clears the event. Consumer side only.
    pub fn reset(&self) {
        debug_assert!(
            self.state.get() != State::Waiting,
            "reset with a parked waiter"
        );
        if self.state.get() == State::Set {
            self.state.set(State::NotSet);
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.get() == State::Set
    }

    /// Suspends until the event is set. Does not consume the signal; pair
    /// with [`reset`].
    ///
    /// [`reset`]: Event::reset
    pub fn wait(&self) -> Wait<'_> {
        Wait { event: self }
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

/// Future of [`Event::wait`].
#[derive(Debug)]
pub struct Wait<'a> {
    event: &'a Event,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.event.state.get() {
            State::Set => Poll::Ready(()),
            State::NotSet => {
                self.event.state.set(State::Waiting);
                *self.event.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Waiting => {
                // Same consumer polled again (a spurious wake); refresh
                // the waker. A second consumer is a contract violation.
                *self.event.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.event.state.get() == State::Waiting {
            self.event.state.set(State::NotSet);
            self.event.waker.borrow_mut().take();
        }
    }
}
