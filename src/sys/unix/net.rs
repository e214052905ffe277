//! Non-blocking socket syscalls.
//!
//! Every descriptor produced here is non-blocking and close-on-exec from
//! birth; platforms without `SOCK_NONBLOCK`/`accept4` fall back to
//! `fcntl` after the fact.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;

/// Raw `sockaddr` storage plus its length, ready for `bind(2)`.
pub(crate) struct SocketAddrRaw {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SocketAddrRaw {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        self.len
    }
}

pub(crate) fn socket_addr(addr: &SocketAddr) -> SocketAddrRaw {
    // SAFETY: all-zeroes is a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(addr) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            // SAFETY: `sockaddr_in` fits in `sockaddr_storage`.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = addr.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(addr) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            // SAFETY: `sockaddr_in6` fits in `sockaddr_storage`.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = addr.port().to_be();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                };
                (*sin6).sin6_flowinfo = addr.flowinfo();
                (*sin6).sin6_scope_id = addr.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    SocketAddrRaw {
        storage,
        len: len as libc::socklen_t,
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn new_socket(family: libc::c_int, kind: libc::c_int) -> io::Result<RawFd> {
    syscall!(socket(
        family,
        kind | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn new_socket(family: libc::c_int, kind: libc::c_int) -> io::Result<RawFd> {
    let socket = syscall!(socket(family, kind, 0))?;
    // On this platform the flags cannot be set atomically with the
    // creation, so close the socket on any failure in between.
    syscall!(fcntl(socket, libc::F_SETFL, libc::O_NONBLOCK))
        .and_then(|_| syscall!(fcntl(socket, libc::F_SETFD, libc::FD_CLOEXEC)))
        .inspect_err(|_| {
            let _ = syscall!(close(socket));
        })?;
    Ok(socket)
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let raw = socket_addr(addr);
    syscall!(bind(fd, raw.as_ptr(), raw.len())).map(|_| ())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn accept(fd: RawFd) -> io::Result<RawFd> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn accept(fd: RawFd) -> io::Result<RawFd> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let socket = syscall!(accept(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    syscall!(fcntl(socket, libc::F_SETFL, libc::O_NONBLOCK))
        .and_then(|_| syscall!(fcntl(socket, libc::F_SETFD, libc::FD_CLOEXEC)))
        .inspect_err(|_| {
            let _ = syscall!(close(socket));
        })?;
    Ok(socket)
}

pub(crate) fn set_reuseaddr(fd: RawFd, enable: bool) -> io::Result<()> {
    let value: libc::c_int = i32::from(enable);
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &value as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    let value: libc::c_int = i32::from(enable);
    syscall!(setsockopt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_NODELAY,
        &value as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn shutdown(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_RDWR)).map(|_| ())
}

/// Closes a descriptor whose ownership was already taken back from
/// `OwnedFd`, so the close error can be reported.
pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

/// Resolves `host:port` through the system resolver.
///
/// `AI_PASSIVE` makes wildcard hosts resolve to the any-address, which is
/// what a listener wants.
pub(crate) fn resolve(
    host: &str,
    port: &str,
    kind: libc::c_int,
    passive: bool,
) -> io::Result<Vec<SocketAddr>> {
    let host = CString::new(host)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "host contains NUL"))?;
    let port = CString::new(port)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "port contains NUL"))?;

    // SAFETY: all-zeroes is a valid `addrinfo` for hints.
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_socktype = kind;
    hints.ai_flags = if passive { libc::AI_PASSIVE } else { 0 };

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: the hints and out-pointer are valid; a zero return hands us
    // ownership of `list`, released below.
    let rc = unsafe { libc::getaddrinfo(host.as_ptr(), port.as_ptr(), &hints, &mut list) };
    if rc != 0 {
        return Err(gai_error(rc));
    }

    let mut addrs = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        // SAFETY: the resolver produced a well-formed linked list.
        unsafe {
            let info = &*cursor;
            match info.ai_family {
                libc::AF_INET => {
                    let sin = &*(info.ai_addr as *const libc::sockaddr_in);
                    addrs.push(SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                        u16::from_be(sin.sin_port),
                    )));
                }
                libc::AF_INET6 => {
                    let sin6 = &*(info.ai_addr as *const libc::sockaddr_in6);
                    addrs.push(SocketAddr::V6(SocketAddrV6::new(
                        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                        u16::from_be(sin6.sin6_port),
                        sin6.sin6_flowinfo,
                        sin6.sin6_scope_id,
                    )));
                }
                _ => {}
            }
            cursor = info.ai_next;
        }
    }
    // SAFETY: `list` came from a successful `getaddrinfo`.
    unsafe { libc::freeaddrinfo(list) };

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no address found",
        ));
    }
    Ok(addrs)
}

fn gai_error(rc: libc::c_int) -> io::Error {
    if rc == libc::EAI_SYSTEM {
        return io::Error::last_os_error();
    }
    // SAFETY: `gai_strerror` returns a static NUL-terminated string.
    let message = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
    io::Error::new(
        io::ErrorKind::Other,
        message.to_string_lossy().into_owned(),
    )
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the OS filled in a `sockaddr_in` for AF_INET.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: the OS filled in a `sockaddr_in6` for AF_INET6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(io::ErrorKind::Other, "unexpected family")),
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    storage_to_addr(&storage)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    storage_to_addr(&storage)
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}
