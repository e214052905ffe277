//! Wakes the selector out of a blocking `select` call.
//!
//! Linux uses an eventfd, the other platforms a non-blocking pipe. Either
//! way the write side is a single syscall that is safe to issue from a
//! signal handler, which is how `Closer` interrupts a running service.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// The descriptor the selector watches for wake-ups.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The descriptor `wake_raw` writes to; for an eventfd both are the
    /// same descriptor.
    pub(crate) fn write_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drains the wake-up so the next `select` blocks again.
    pub(crate) fn ack(&self) {
        let mut buf = [0u8; 8];
        let _ = syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        ));
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn wake_raw(fd: RawFd) {
    let value = 1u64.to_ne_bytes();
    let _ = syscall!(write(fd, value.as_ptr() as *const libc::c_void, value.len()));
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[derive(Debug)]
pub(crate) struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let mut fds = [-1 as libc::c_int; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        // SAFETY: `pipe(2)` ensures both fds are valid.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        }
        Ok(Waker { read, write })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    pub(crate) fn ack(&self) {
        let mut buf = [0u8; 16];
        let _ = syscall!(read(
            self.read.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        ));
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn wake_raw(fd: RawFd) {
    let value = [1u8];
    let _ = syscall!(write(fd, value.as_ptr() as *const libc::c_void, value.len()));
}
