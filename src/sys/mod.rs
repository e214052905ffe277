//! Platform specific code.
//!
//! Everything OS dependent lives below this module: the readiness selector
//! (epoll on Linux and Android, kqueue on the BSDs and macOS), the loop
//! waker and the non-blocking socket syscalls. The rest of the crate only
//! sees the types re-exported here.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{
    net, set_affinity, wake_raw, Events, Mmap, Selector, Waker,
};

#[cfg(not(unix))]
compile_error!("corio only supports readiness based selectors (epoll/kqueue)");
