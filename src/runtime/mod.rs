//! The coroutine primitives: task handles, generators, the asynchronous
//! mutex and the single-consumer event.
//!
//! Everything here is single-threaded and cooperative. Atomics appear
//! where the handoff protocols demand a memory-ordering discipline (task
//! completion, the mutex waiter stack, the generator rendezvous), not
//! because resumes ever cross threads.

pub mod async_generator;
pub mod event;
pub mod generator;
pub mod mutex;
pub(crate) mod task;

pub use self::async_generator::{async_generator, AsyncGenerator, YieldHandle};
pub use self::event::Event;
pub use self::generator::{generator, Generator, YieldPoint};
pub use self::mutex::{AsyncMutex, LockGuard};
pub use self::task::Task;
