/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that uses them.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod mmap;
pub(crate) mod net;

pub(crate) use self::mmap::Mmap;

mod selector;
pub(crate) use self::selector::{Event, Events, Selector};

mod waker;
pub(crate) use self::waker::{wake_raw, Waker};

use std::io;

/// Pins the calling thread to `processor`.
///
/// Only Linux exposes a per-thread affinity call; on the other supported
/// platforms this is a no-op.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn set_affinity(processor: usize) -> io::Result<()> {
    let mut set = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
    unsafe { libc::CPU_SET(processor, &mut set) };
    syscall!(sched_setaffinity(
        0,
        std::mem::size_of::<libc::cpu_set_t>(),
        &set,
    ))
    .map(|_| ())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn set_affinity(processor: usize) -> io::Result<()> {
    log::debug!("thread affinity not supported, ignoring processor {}", processor);
    Ok(())
}
