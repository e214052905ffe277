use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, io, ptr};

use crate::interest::Interest;
use crate::token::Token;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Flags = libc::c_ushort;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

fn kevent(ident: RawFd, filter: Filter, flags: Flags, token: Token) -> libc::kevent {
    // Field by field instead of a struct literal: the BSDs disagree on the
    // padding fields `kevent` carries.
    let mut event: libc::kevent = unsafe { std::mem::zeroed() };
    event.ident = ident as libc::uintptr_t;
    event.filter = filter;
    event.flags = flags;
    event.udata = token.0 as UData;
    event
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            // `Duration::subsec_nanos` is guaranteed to be less than one
            // billion, making the cast to i32 safe.
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        events.inner.clear();
        syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.inner.as_mut_ptr(),
            events.inner.capacity() as Count,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `kevent` ensures that `n_events` are
            // assigned.
            unsafe { events.inner.set_len(n_events as usize) };
        })
    }

    /// Arms a one-shot readiness registration for `fd`.
    ///
    /// `EV_ONESHOT` deletes the filter on delivery, so a fired
    /// registration needs no `disarm`.
    pub(crate) fn arm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let filter = if interest.is_readable() {
            libc::EVFILT_READ
        } else {
            libc::EVFILT_WRITE
        };
        let changes = [kevent(
            fd,
            filter as Filter,
            (libc::EV_ADD | libc::EV_ONESHOT) as Flags,
            token,
        )];
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))
        .map(|_| ())
    }

    /// Removes a registration that has not fired yet.
    pub(crate) fn disarm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let filter = if interest.is_readable() {
            libc::EVFILT_READ
        } else {
            libc::EVFILT_WRITE
        };
        let changes = [kevent(fd, filter as Filter, libc::EV_DELETE as Flags, Token(0))];
        match syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            ptr::null_mut(),
            0,
            ptr::null(),
        )) {
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Read registration that stays armed, used for the loop waker.
    pub(crate) fn register_persistent(&self, fd: RawFd, token: Token) -> io::Result<()> {
        let changes = [kevent(
            fd,
            libc::EVFILT_READ as Filter,
            (libc::EV_ADD | libc::EV_CLEAR) as Flags,
            token,
        )];
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))
        .map(|_| ())
    }
}

pub(crate) type Event = libc::kevent;

// No `Debug` derive: the raw event type has none without libc's
// `extra_traits` feature.
pub(crate) struct Events {
    inner: Vec<Event>,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.inner.iter().map(|event| Token(event.udata as usize))
    }
}
