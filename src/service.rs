use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::mem::ManuallyDrop;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use log::{error, trace};
use slab::Slab;

use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::runtime::task::{CompletionGuard, JoinCell, Task};
use crate::sys;
use crate::token::Token;

const EVENTS_CAPACITY: usize = 1024;

/// Token reserved for the loop waker; slab keys never reach it.
const WAKE: Token = Token(usize::MAX);

/// The event loop: a readiness selector plus a run queue of coroutines.
///
/// One `Service` owns one OS selector (epoll or kqueue) and schedules every
/// coroutine spawned onto it on the calling thread. Suspended I/O
/// operations park a one-shot registration in the selector; `run` blocks
/// in the selector, marks fired registrations ready and resumes the
/// coroutines that waited on them.
///
/// Handles are cheap to clone and refer to the same loop.
#[derive(Clone)]
pub struct Service {
    inner: Rc<Inner>,
}

impl Service {
    /// Creates the selector and the loop waker.
    pub fn new() -> Result<Service> {
        let selector = sys::Selector::new().map_err(|e| Error::io("create service", e))?;
        let waker = sys::Waker::new().map_err(|e| Error::io("create service", e))?;
        selector
            .register_persistent(waker.read_fd(), WAKE)
            .map_err(|e| Error::io("create service", e))?;
        Ok(Service {
            inner: Rc::new(Inner {
                selector,
                waker,
                ops: RefCell::new(Slab::new()),
                queue: RefCell::new(VecDeque::new()),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    /// Runs the loop until [`close`] is called.
    ///
    /// `processor >= 0` pins the thread to that CPU first. Only OS level
    /// selector failures propagate out of here; per-coroutine failures
    /// stay inside their coroutines.
    ///
    /// [`close`]: Service::close
    pub fn run(&self, processor: i32) -> Result<()> {
        if processor >= 0 {
            sys::set_affinity(processor as usize)
                .map_err(|e| Error::io("set thread affinity", e))?;
        }
        let mut events = sys::Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.inner.drain();
            if self.inner.closed.load(Ordering::Acquire) {
                self.inner.teardown();
                return Ok(());
            }
            if !self.inner.queue.borrow().is_empty() {
                continue;
            }
            self.inner.poll_events(&mut events)?;
        }
    }

    /// Runs the loop until `future` completes and returns its output.
    ///
    /// This is the bounded entry point used by tests and by demos that
    /// wait for a root task instead of running forever.
    pub fn block_on<T, F>(&self, future: F) -> Result<T>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let task = self.spawn(future);
        let mut events = sys::Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.inner.drain();
            if let Some(value) = task.try_take() {
                return value;
            }
            if self.inner.closed.load(Ordering::Acquire) {
                self.inner.teardown();
                return Err(Error::Closed);
            }
            if !self.inner.queue.borrow().is_empty() {
                continue;
            }
            self.inner.poll_events(&mut events)?;
        }
    }

    /// Spawns a coroutine onto the loop.
    ///
    /// The coroutine starts lazily, on the next turn of the loop. The
    /// returned [`Task`] owns it; see there for the await and cancel
    /// contract.
    pub fn spawn<T, F>(&self, future: F) -> Task<T>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let cell = JoinCell::new();
        let guard = CompletionGuard::new(cell.clone());
        let wrapped = async move {
            let value = future.await;
            guard.complete(value);
        };
        let task = Rc::new(TaskCell {
            future: RefCell::new(Some(Box::pin(wrapped))),
            queued: Cell::new(false),
            inner: Rc::downgrade(&self.inner),
        });
        TaskCell::schedule(&task);
        Task::new(cell, task)
    }

    /// Requests the loop to stop. Idempotent, callable from a signal
    /// handler through [`closer`].
    ///
    /// [`closer`]: Service::closer
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        sys::wake_raw(self.inner.waker.write_fd());
    }

    /// A `Send + Sync` handle that closes the service from foreign
    /// contexts (signal handlers, other threads). Must not be used after
    /// the service is gone.
    pub fn closer(&self) -> Closer {
        Closer {
            closed: self.inner.closed.clone(),
            wake_fd: self.inner.waker.write_fd(),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<Inner> {
        &self.inner
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Service")
            .field("operations", &self.inner.ops.borrow().len())
            .field("queued", &self.inner.queue.borrow().len())
            .finish()
    }
}

/// Closes a [`Service`] from outside its thread of control.
#[derive(Clone, Debug)]
pub struct Closer {
    closed: Arc<AtomicBool>,
    wake_fd: RawFd,
}

impl Closer {
    /// Marks the service closed and interrupts its selector. Both steps
    /// are async-signal-safe.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        sys::wake_raw(self.wake_fd);
    }
}

pub(crate) struct Inner {
    selector: sys::Selector,
    waker: sys::Waker,
    ops: RefCell<Slab<OpEntry>>,
    queue: RefCell<VecDeque<Rc<TaskCell>>>,
    closed: Arc<AtomicBool>,
}

struct OpEntry {
    fd: RawFd,
    interest: Interest,
    waker: RefCell<Waker>,
    state: Cell<OpState>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum OpState {
    Waiting,
    Ready,
    Closed,
}

impl Inner {
    /// Polls every queued coroutine until the queue settles.
    fn drain(&self) {
        loop {
            let task = self.queue.borrow_mut().pop_front();
            let Some(task) = task else { break };
            task.queued.set(false);
            let waker = task_waker(&task);
            let mut cx = Context::from_waker(&waker);
            let mut slot = task.future.borrow_mut();
            if let Some(future) = slot.as_mut() {
                if future.as_mut().poll(&mut cx).is_ready() {
                    *slot = None;
                }
            }
        }
    }

    /// Blocks in the selector once and marks fired registrations ready.
    fn poll_events(&self, events: &mut sys::Events) -> Result<()> {
        if let Err(err) = self.selector.select(events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::io("get queued events", err));
        }
        let mut wakers = Vec::new();
        {
            let ops = self.ops.borrow();
            for token in events.tokens() {
                if token == WAKE {
                    self.waker.ack();
                    continue;
                }
                // The registration may already be gone if the operation
                // was dropped after the event fired.
                if let Some(entry) = ops.get(token.0) {
                    if entry.state.get() == OpState::Waiting {
                        entry.state.set(OpState::Ready);
                        wakers.push(entry.waker.borrow().clone());
                    }
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// Close observed: drop the queue and the registrations. Coroutines
    /// parked in the selector are abandoned, per the resource model;
    /// their task handles observe broken promises as the frames go.
    fn teardown(&self) {
        loop {
            let drained: Vec<_> = self.queue.borrow_mut().drain(..).collect();
            if drained.is_empty() {
                break;
            }
            // Dropping frames may re-enqueue through completion wakers;
            // loop until the queue stays empty.
            drop(drained);
        }
        let entries: Vec<_> = {
            let mut ops = self.ops.borrow_mut();
            let entries = ops.drain().collect();
            entries
        };
        for entry in &entries {
            let _ = self.selector.disarm(entry.fd, entry.interest);
        }
    }

    pub(crate) fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        waker: Waker,
    ) -> io::Result<usize> {
        let mut ops = self.ops.borrow_mut();
        let entry = ops.vacant_entry();
        let key = entry.key();
        self.selector.arm(fd, Token(key), interest)?;
        trace!("registering operation {} for fd {} ({:?})", key, fd, interest);
        entry.insert(OpEntry {
            fd,
            interest,
            waker: RefCell::new(waker),
            state: Cell::new(OpState::Waiting),
        });
        Ok(key)
    }

    pub(crate) fn deregister(&self, key: usize) {
        let entry = self.ops.borrow_mut().try_remove(key);
        if let Some(entry) = entry {
            if entry.state.get() != OpState::Closed {
                let _ = self.selector.disarm(entry.fd, entry.interest);
            }
        }
    }

    /// Fails every pending operation on `fd` with a closed-descriptor
    /// error and wakes its coroutine. Called by the socket close path
    /// before the descriptor itself goes away.
    pub(crate) fn cancel_fd(&self, fd: RawFd) {
        let mut wakers = Vec::new();
        {
            let ops = self.ops.borrow();
            for (_, entry) in ops.iter() {
                if entry.fd == fd && entry.state.get() == OpState::Waiting {
                    entry.state.set(OpState::Closed);
                    let _ = self.selector.disarm(entry.fd, entry.interest);
                    wakers.push(entry.waker.borrow().clone());
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

/// One spawned coroutine: its frame and its place in the run queue.
pub(crate) struct TaskCell {
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    queued: Cell<bool>,
    inner: Weak<Inner>,
}

impl TaskCell {
    fn schedule(self: &Rc<TaskCell>) {
        if self.queued.replace(true) {
            return;
        }
        match self.inner.upgrade() {
            Some(inner) => inner.queue.borrow_mut().push_back(self.clone()),
            None => self.queued.set(false),
        }
    }

    /// Destroys the coroutine frame. Safe to call on a finished task.
    pub(crate) fn cancel(&self) {
        if let Ok(mut slot) = self.future.try_borrow_mut() {
            *slot = None;
        } else {
            // The frame is cancelling itself from inside its own poll;
            // the run loop drops it when the poll returns.
            error!("task cancelled itself while running");
        }
    }
}

// Waker over an `Rc<TaskCell>`. The vtable contract is upheld manually:
// clone increments the strong count, wake consumes it, wake_by_ref borrows
// it. The waker never leaves the loop's thread.
static TASK_WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
    task_waker_clone,
    task_waker_wake,
    task_waker_wake_by_ref,
    task_waker_drop,
);

fn task_waker(cell: &Rc<TaskCell>) -> Waker {
    let ptr = Rc::into_raw(cell.clone()) as *const ();
    // SAFETY: the pointer came from `Rc::into_raw` and the vtable keeps
    // the reference count balanced.
    unsafe { Waker::from_raw(RawWaker::new(ptr, &TASK_WAKER_VTABLE)) }
}

unsafe fn task_waker_clone(ptr: *const ()) -> RawWaker {
    Rc::increment_strong_count(ptr as *const TaskCell);
    RawWaker::new(ptr, &TASK_WAKER_VTABLE)
}

unsafe fn task_waker_wake(ptr: *const ()) {
    let cell = Rc::from_raw(ptr as *const TaskCell);
    TaskCell::schedule(&cell);
}

unsafe fn task_waker_wake_by_ref(ptr: *const ()) {
    let cell = ManuallyDrop::new(Rc::from_raw(ptr as *const TaskCell));
    TaskCell::schedule(&cell);
}

unsafe fn task_waker_drop(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const TaskCell));
}

/// Suspends until `fd` is ready for `interest` or its socket closes.
///
/// The registration is armed on first poll and removed on completion or
/// drop, so abandoning the future mid-wait leaves nothing behind in the
/// selector.
pub(crate) struct Readiness {
    inner: Rc<Inner>,
    fd: RawFd,
    interest: Interest,
    key: Option<usize>,
}

impl Readiness {
    pub(crate) fn new(service: &Service, fd: RawFd, interest: Interest) -> Readiness {
        Readiness {
            inner: service.inner().clone(),
            fd,
            interest,
            key: None,
        }
    }
}

impl Future for Readiness {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.key {
            None => {
                let key = match self.inner.register(self.fd, self.interest, cx.waker().clone()) {
                    Ok(key) => key,
                    Err(err) => return Poll::Ready(Err(err)),
                };
                self.key = Some(key);
                Poll::Pending
            }
            Some(key) => {
                let state = {
                    let ops = self.inner.ops.borrow();
                    match ops.get(key) {
                        Some(entry) => {
                            if entry.state.get() == OpState::Waiting {
                                *entry.waker.borrow_mut() = cx.waker().clone();
                            }
                            entry.state.get()
                        }
                        // Torn down underneath us; report the descriptor
                        // gone.
                        None => OpState::Closed,
                    }
                };
                match state {
                    OpState::Waiting => Poll::Pending,
                    OpState::Ready => {
                        self.inner.deregister(key);
                        self.key = None;
                        Poll::Ready(Ok(()))
                    }
                    OpState::Closed => {
                        self.inner.ops.borrow_mut().try_remove(key);
                        self.key = None;
                        Poll::Ready(Err(closed_error()))
                    }
                }
            }
        }
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.inner.deregister(key);
        }
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "descriptor closed")
}
