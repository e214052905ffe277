//! Process-wide signal registry.
//!
//! Keeps one `{signum → handler}` mapping for the lifetime of the
//! process. [`trap`] installs, [`reset`] tears down. Handlers run in
//! signal context: keep them to async-signal-safe work, such as
//! [`Closer::close`].
//!
//! [`Closer::close`]: crate::Closer::close
//!
//! ```no_run
//! # fn main() -> corio::Result<()> {
//! let service = corio::Service::new()?;
//! let closer = service.closer();
//! corio::signal::trap(libc::SIGINT, move || closer.close())?;
//! corio::signal::ignore(libc::SIGPIPE)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

type Handler = Box<dyn Fn() + Send>;

static REGISTRY: OnceLock<Mutex<HashMap<libc::c_int, Handler>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<libc::c_int, Handler>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

extern "C" fn trampoline(signum: libc::c_int) {
    // A signal that fires while the registry is being mutated is dropped
    // rather than deadlocked on.
    if let Ok(registry) = registry().try_lock() {
        if let Some(handler) = registry.get(&signum) {
            handler();
        }
    }
}

/// Registers `handler` for `signum` and installs the trampoline.
pub fn trap(signum: i32, handler: impl Fn() + Send + 'static) -> Result<()> {
    registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(signum, Box::new(handler));
    install(signum, trampoline as extern "C" fn(libc::c_int) as usize)
}

/// Ignores `signum` (`SIG_IGN`).
pub fn ignore(signum: i32) -> Result<()> {
    registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&signum);
    install(signum, libc::SIG_IGN)
}

/// Restores the default disposition and forgets the handler.
pub fn reset(signum: i32) -> Result<()> {
    install(signum, libc::SIG_DFL)?;
    registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&signum);
    Ok(())
}

fn install(signum: libc::c_int, action: usize) -> Result<()> {
    // SAFETY: a zeroed sigaction is valid; the trampoline only touches
    // the registry.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = action;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signum, &sa, ptr::null_mut()) < 0 {
            return Err(Error::io("trap signal", io::Error::last_os_error()));
        }
    }
    Ok(())
}
