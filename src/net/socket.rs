use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::runtime::{async_generator, AsyncGenerator};
use crate::service::{closed_error, Readiness, Service};
use crate::sys;
use crate::tls::TlsSession;

/// Address family of a [`Socket`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub(crate) fn raw(self) -> libc::c_int {
        match self {
            Family::Ipv4 => libc::AF_INET,
            Family::Ipv6 => libc::AF_INET6,
        }
    }
}

/// Transport type of a [`Socket`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Tcp,
    Udp,
}

impl Kind {
    pub(crate) fn raw(self) -> libc::c_int {
        match self {
            Kind::Tcp => libc::SOCK_STREAM,
            Kind::Udp => libc::SOCK_DGRAM,
        }
    }
}

/// Options settable through [`Socket::set`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketOption {
    Nodelay,
}

/// A non-blocking socket whose `recv`/`send` suspend on the service's
/// selector instead of blocking the thread.
///
/// Ownership of the descriptor is exclusive; the socket is move-only and
/// closes on drop. When a TLS session is attached (sockets accepted from a
/// TLS-configured [`Server`]), every operation routes through the bridge.
///
/// [`Server`]: crate::net::Server
#[derive(Debug)]
pub struct Socket {
    service: Service,
    fd: Option<OwnedFd>,
    tls: Option<TlsSession>,
}

impl Socket {
    pub(crate) fn new(service: Service, fd: OwnedFd) -> Socket {
        Socket {
            service,
            fd: Some(fd),
            tls: None,
        }
    }

    /// Opens a non-blocking socket on the given service.
    pub fn create(service: &Service, family: Family, kind: Kind) -> Result<Socket> {
        let fd = sys::net::new_socket(family.raw(), kind.raw())
            .map_err(|e| Error::io("create socket", e))?;
        // SAFETY: `new_socket` returned a freshly created descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Socket::new(service.clone(), fd))
    }

    pub(crate) fn attach_tls(&mut self, session: TlsSession) {
        self.tls = Some(session);
    }

    fn raw(&self) -> Result<RawFd> {
        match &self.fd {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(Error::io("socket", closed_error())),
        }
    }

    /// Sets a socket option.
    pub fn set(&self, option: SocketOption, enable: bool) -> Result<()> {
        let fd = self.raw()?;
        match option {
            SocketOption::Nodelay => sys::net::set_nodelay(fd, enable)
                .map_err(|e| Error::io("set socket option", e)),
        }
    }

    /// Runs the TLS handshake, if a TLS session is attached.
    ///
    /// Returns `false` when the peer closed before the handshake finished;
    /// plain sockets succeed immediately.
    pub async fn handshake(&mut self) -> Result<bool> {
        let fd = self.raw()?;
        match self.tls.as_mut() {
            Some(tls) => tls.handshake(&self.service, fd).await,
            None => Ok(true),
        }
    }

    /// The ALPN protocol negotiated by the handshake, if any.
    pub fn alpn(&self) -> Option<&str> {
        self.tls.as_ref().and_then(TlsSession::alpn)
    }

    /// The address of the connected peer.
    pub fn peer(&self) -> Result<std::net::SocketAddr> {
        let fd = self.raw()?;
        sys::net::peer_addr(fd).map_err(|e| Error::io("socket", e))
    }

    /// Receives into `buf`, suspending until bytes are available.
    ///
    /// Returns the number of bytes received; zero means the peer closed
    /// in an orderly fashion.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.raw()?;
        match self.tls.as_mut() {
            Some(tls) => tls.recv(&self.service, fd, buf).await,
            None => native_recv(&self.service, fd, buf).await,
        }
    }

    /// Sends the whole buffer, suspending as needed.
    ///
    /// Returns `false` when the peer closed before everything was
    /// written.
    pub async fn send(&mut self, data: &[u8]) -> Result<bool> {
        let fd = self.raw()?;
        match self.tls.as_mut() {
            Some(tls) => tls.send(&self.service, fd, data).await,
            None => native_send(&self.service, fd, data).await,
        }
    }

    /// Wraps [`recv`] in an asynchronous sequence of chunks of at most
    /// `size` bytes that ends on orderly close.
    ///
    /// [`recv`]: Socket::recv
    pub fn recv_stream(&mut self, size: usize) -> AsyncGenerator<'_, Bytes> {
        async_generator(move |y| async move {
            loop {
                let mut chunk = BytesMut::zeroed(size);
                let n = self.recv(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                chunk.truncate(n);
                y.value(chunk.freeze()).await;
            }
        })
    }

    /// Closes the socket: TLS teardown first, then shutdown, then the
    /// descriptor. Idempotent; repeated calls succeed.
    pub fn close(&mut self) -> Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let raw = fd.as_raw_fd();
        if let Some(mut tls) = self.tls.take() {
            tls.shutdown(raw);
        }
        // Fail pending suspensions before the descriptor goes away.
        self.service.inner().cancel_fd(raw);
        let _ = sys::net::shutdown(raw);
        sys::net::close(fd.into_raw_fd()).map_err(|e| Error::io("close socket", e))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub(crate) async fn native_recv(service: &Service, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        match sys::net::recv(fd, buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Readiness::new(service, fd, Interest::READABLE)
                    .await
                    .map_err(|e| Error::io("recv", e))?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::io("recv", err)),
        }
    }
}

pub(crate) async fn native_send(service: &Service, fd: RawFd, data: &[u8]) -> Result<bool> {
    let mut offset = 0;
    while offset < data.len() {
        match sys::net::send(fd, &data[offset..]) {
            Ok(0) => return Ok(false),
            Ok(n) => offset += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Readiness::new(service, fd, Interest::WRITABLE)
                    .await
                    .map_err(|e| Error::io("send", e))?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::io("send", err)),
        }
    }
    Ok(true)
}
