use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};

use crate::interest::Interest;
use crate::token::Token;

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.inner.set_len(n_events as usize) };
        })
    }

    /// Arms a one-shot readiness registration for `fd`.
    ///
    /// The registration fires at most once; `disarm` removes what is left
    /// of it afterwards. Re-arming an fd that is still known to the epoll
    /// instance downgrades to `EPOLL_CTL_MOD`.
    pub(crate) fn arm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest) | EPOLLONESHOT as u32,
            u64: token.0 as u64,
        };

        let ep = self.ep.as_raw_fd();
        match syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)) {
            Err(ref err) if err.raw_os_error() == Some(libc::EEXIST) => {
                syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    pub(crate) fn disarm(&self, fd: RawFd, _interest: Interest) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        match syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())) {
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Level-triggered read registration that stays armed, used for the
    /// loop waker.
    pub(crate) fn register_persistent(&self, fd: RawFd, token: Token) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: EPOLLIN as u32,
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

pub(crate) type Event = libc::epoll_event;

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
        self.inner.iter().map(|event| Token(event.u64 as usize))
    }
}
