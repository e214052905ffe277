use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

// `state` holds one of the two sentinels or a pointer to the most recently
// arrived waiter. LOCKED_NO_WAITERS doubles as the null terminator of the
// arrival stack, exactly like the pointer encoding it replaces.
const NOT_LOCKED: usize = 1;
const LOCKED_NO_WAITERS: usize = 0;

/// An asynchronous FIFO mutex.
///
/// Arriving waiters push themselves onto a lock-free LIFO stack; `unlock`
/// refills its private FIFO list from that stack (reversing it) whenever
/// the list runs dry, which makes the overall order strictly first-come
/// first-served across unlock boundaries. Resuming a waiter transfers lock
/// ownership to it directly, the lock is never released in between.
///
/// The runtime is single-threaded; the atomics carry the ordering
/// discipline of the algorithm, not cross-thread traffic.
pub struct AsyncMutex {
    state: AtomicUsize,
    /// FIFO list of waiters already transferred out of the arrival stack.
    waiters: Cell<*const Waiter>,
}

struct Waiter {
    waker: Cell<Option<Waker>>,
    next: Cell<*const Waiter>,
    /// Lock ownership was transferred to this waiter.
    resumed: Cell<bool>,
}

impl AsyncMutex {
    pub fn new() -> AsyncMutex {
        AsyncMutex {
            state: AtomicUsize::new(NOT_LOCKED),
            waiters: Cell::new(ptr::null()),
        }
    }

    /// Attempts to acquire the lock without suspending.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(NOT_LOCKED, LOCKED_NO_WAITERS, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the lock, suspending while another holder is inside.
    /// The caller owns the lock afterwards and must call [`unlock`].
    ///
    /// [`unlock`]: AsyncMutex::unlock
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            node: Waiter {
                waker: Cell::new(None),
                next: Cell::new(ptr::null()),
                resumed: Cell::new(false),
            },
            state: LockState::Init,
            _pin: PhantomPinned,
        }
    }

    /// Like [`lock`], but resolves to a guard that unlocks on scope exit.
    ///
    /// [`lock`]: AsyncMutex::lock
    pub fn scoped_lock(&self) -> ScopedLock<'_> {
        ScopedLock { inner: self.lock() }
    }

    /// Releases the lock, or hands it to the longest waiting coroutine.
    pub fn unlock(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) != NOT_LOCKED);

        let mut head = self.waiters.get();
        if head.is_null() {
            let released = self
                .state
                .compare_exchange(
                    LOCKED_NO_WAITERS,
                    NOT_LOCKED,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok();
            if released {
                return;
            }

            // At least one new arrival: steal the stack and reverse it so
            // the earliest arrival ends up at the head of the list.
            let old = self.state.swap(LOCKED_NO_WAITERS, Ordering::AcqRel);
            debug_assert!(old != LOCKED_NO_WAITERS && old != NOT_LOCKED);
            let mut next = old as *const Waiter;
            while !next.is_null() {
                // SAFETY: queued waiters are pinned inside their lock
                // futures and unlink themselves before dropping.
                unsafe {
                    let temp = (*next).next.get();
                    (*next).next.set(head);
                    head = next;
                    next = temp;
                }
            }
        }

        debug_assert!(!head.is_null());
        // SAFETY: as above; the head stays alive at least until its waker
        // fires and the owning future observes `resumed`.
        unsafe {
            self.waiters.set((*head).next.get());
            (*head).resumed.set(true);
            if let Some(waker) = (*head).waker.take() {
                waker.wake();
            }
        }
    }

    /// Unlinks an abandoned waiter. Single-threaded, so plain walks over
    /// both lists are race-free.
    fn forget_waiter(&self, node: *const Waiter) {
        let current = self.state.load(Ordering::Acquire);
        if current != NOT_LOCKED && current != LOCKED_NO_WAITERS {
            if current == node as usize {
                // SAFETY: `node` is the pinned waiter being dropped.
                let next = unsafe { (*node).next.get() };
                let replacement = if next.is_null() {
                    LOCKED_NO_WAITERS
                } else {
                    next as usize
                };
                if self
                    .state
                    .compare_exchange(current, replacement, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else {
                let mut prev = current as *const Waiter;
                while !prev.is_null() {
                    // SAFETY: all linked waiters are pinned and alive.
                    unsafe {
                        let next = (*prev).next.get();
                        if next == node {
                            (*prev).next.set((*node).next.get());
                            return;
                        }
                        prev = next;
                    }
                }
            }
        }

        // Not in the arrival stack: it must be in the active list.
        let head = self.waiters.get();
        if head == node {
            // SAFETY: as above.
            self.waiters.set(unsafe { (*node).next.get() });
            return;
        }
        let mut prev = head;
        while !prev.is_null() {
            // SAFETY: as above.
            unsafe {
                let next = (*prev).next.get();
                if next == node {
                    (*prev).next.set((*node).next.get());
                    return;
                }
                prev = next;
            }
        }
    }
}

impl Default for AsyncMutex {
    fn default() -> AsyncMutex {
        AsyncMutex::new()
    }
}

impl Drop for AsyncMutex {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Relaxed);
        debug_assert!(
            state == NOT_LOCKED || state == LOCKED_NO_WAITERS,
            "mutex dropped with queued waiters"
        );
        debug_assert!(self.waiters.get().is_null());
    }
}

impl std::fmt::Debug for AsyncMutex {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        fmt.debug_struct("AsyncMutex")
            .field("locked", &(state != NOT_LOCKED))
            .finish()
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum LockState {
    Init,
    Queued,
    Done,
}

/// Future of [`AsyncMutex::lock`].
pub struct Lock<'a> {
    mutex: &'a AsyncMutex,
    node: Waiter,
    state: LockState,
    _pin: PhantomPinned,
}

impl Future for Lock<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: the waiter node is never moved out; its address stays
        // valid for as long as it is linked.
        let this = unsafe { self.get_unchecked_mut() };
        match this.state {
            LockState::Done => panic!("lock future polled after acquisition"),
            LockState::Queued => {
                if this.node.resumed.get() {
                    this.state = LockState::Done;
                    Poll::Ready(())
                } else {
                    this.node.waker.set(Some(cx.waker().clone()));
                    Poll::Pending
                }
            }
            LockState::Init => {
                this.node.waker.set(Some(cx.waker().clone()));
                let mut old = this.mutex.state.load(Ordering::Acquire);
                loop {
                    if old == NOT_LOCKED {
                        match this.mutex.state.compare_exchange_weak(
                            NOT_LOCKED,
                            LOCKED_NO_WAITERS,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                // Acquired without suspending.
                                this.state = LockState::Done;
                                return Poll::Ready(());
                            }
                            Err(actual) => old = actual,
                        }
                    } else {
                        // Push onto the arrival stack; LOCKED_NO_WAITERS
                        // is the null terminator.
                        this.node.next.set(old as *const Waiter);
                        match this.mutex.state.compare_exchange_weak(
                            old,
                            &this.node as *const Waiter as usize,
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                this.state = LockState::Queued;
                                return Poll::Pending;
                            }
                            Err(actual) => old = actual,
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        if self.state != LockState::Queued {
            return;
        }
        if self.node.resumed.get() {
            // Ownership was transferred but never observed; pass it on so
            // the queue keeps moving.
            self.mutex.unlock();
        } else {
            self.mutex.forget_waiter(&self.node as *const Waiter);
        }
    }
}

impl std::fmt::Debug for Lock<'_> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Lock").finish_non_exhaustive()
    }
}

/// Future of [`AsyncMutex::scoped_lock`].
#[derive(Debug)]
pub struct ScopedLock<'a> {
    inner: Lock<'a>,
}

impl<'a> Future for ScopedLock<'a> {
    type Output = LockGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<LockGuard<'a>> {
        let mutex = self.inner.mutex;
        // SAFETY: structural projection onto the pinned inner future.
        let inner = unsafe { self.map_unchecked_mut(|lock| &mut lock.inner) };
        match inner.poll(cx) {
            Poll::Ready(()) => Poll::Ready(LockGuard { mutex }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Releases the lock on scope exit.
#[derive(Debug)]
pub struct LockGuard<'a> {
    mutex: &'a AsyncMutex,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
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
    fn try_lock_and_unlock() {
        let mutex = AsyncMutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn uncontended_lock_does_not_suspend() {
        let mutex = AsyncMutex::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut lock = Box::pin(mutex.lock());
        assert!(lock.as_mut().poll(&mut cx).is_ready());
        mutex.unlock();
    }

    #[test]
    fn waiters_resume_in_arrival_order() {
        let mutex = AsyncMutex::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(mutex.try_lock());
        let mut first = Box::pin(mutex.lock());
        let mut second = Box::pin(mutex.lock());
        let mut third = Box::pin(mutex.lock());
        assert!(first.as_mut().poll(&mut cx).is_pending());
        assert!(second.as_mut().poll(&mut cx).is_pending());
        assert!(third.as_mut().poll(&mut cx).is_pending());

        mutex.unlock();
        assert!(first.as_mut().poll(&mut cx).is_ready());
        assert!(second.as_mut().poll(&mut cx).is_pending());

        mutex.unlock();
        assert!(second.as_mut().poll(&mut cx).is_ready());
        assert!(third.as_mut().poll(&mut cx).is_pending());

        mutex.unlock();
        assert!(third.as_mut().poll(&mut cx).is_ready());
        mutex.unlock();
    }

    #[test]
    fn abandoned_waiter_unlinks_itself() {
        let mutex = AsyncMutex::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(mutex.try_lock());
        let mut kept = Box::pin(mutex.lock());
        {
            let mut dropped = Box::pin(mutex.lock());
            assert!(kept.as_mut().poll(&mut cx).is_pending());
            assert!(dropped.as_mut().poll(&mut cx).is_pending());
        }
        mutex.unlock();
        assert!(kept.as_mut().poll(&mut cx).is_ready());
        mutex.unlock();
    }
}
