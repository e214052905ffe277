use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use log::trace;

use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::net::socket::{Family, Kind, Socket};
use crate::runtime::{async_generator, AsyncGenerator};
use crate::service::{closed_error, Readiness, Service};
use crate::sys;
use crate::tls::TlsContext;

/// A listening socket that accepts connections as an asynchronous
/// sequence.
///
/// # Examples
///
/// ```no_run
/// # fn main() -> corio::Result<()> {
/// use corio::net::{Kind, Server};
/// use corio::Service;
///
/// let service = Service::new()?;
/// let mut server = Server::create(&service, "0.0.0.0", "8080", Kind::Tcp)?;
/// server.configure("res/bundle.pem", Some("h2,http/1.1"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Server {
    service: Service,
    fd: Option<OwnedFd>,
    tls: Option<TlsContext>,
}

impl Server {
    /// Resolves `host:port` (passively, so wildcard hosts become the
    /// any-address), creates the socket, sets `SO_REUSEADDR` and binds.
    pub fn create(service: &Service, host: &str, port: &str, kind: Kind) -> Result<Server> {
        let addr = sys::net::resolve(host, port, kind.raw(), true)
            .map_err(|e| Error::io("resolve address", e))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::io(
                    "resolve address",
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no address found"),
                )
            })?;
        let family = if addr.is_ipv4() {
            Family::Ipv4
        } else {
            Family::Ipv6
        };
        let fd = sys::net::new_socket(family.raw(), kind.raw())
            .map_err(|e| Error::io("create server", e))?;
        // SAFETY: `new_socket` returned a freshly created descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // Allows quick rebinds without waiting for the OS to clean up the
        // previous socket.
        sys::net::set_reuseaddr(fd.as_raw_fd(), true)
            .map_err(|e| Error::io("set server option", e))?;
        sys::net::bind(fd.as_raw_fd(), &addr).map_err(|e| Error::io("bind", e))?;
        Ok(Server {
            service: service.clone(),
            fd: Some(fd),
            tls: None,
        })
    }

    /// Loads a TLS server context from a PEM bundle; every socket accepted
    /// afterwards carries a fresh session cloned from it. `alpn` is a
    /// comma separated preference list, e.g. `"h2,http/1.1"`.
    pub fn configure(&mut self, certificate: &str, alpn: Option<&str>) -> Result<()> {
        self.tls = Some(TlsContext::load(certificate, alpn)?);
        Ok(())
    }

    /// Starts listening and yields accepted sockets.
    ///
    /// A `backlog` of zero means `SOMAXCONN`. Recoverable accept failures
    /// (connection reset before the accept completed) are skipped without
    /// yielding; fatal failures end the sequence with the error.
    pub fn accept(&mut self, backlog: usize) -> AsyncGenerator<'_, Socket> {
        let service = self.service.clone();
        let tls = self.tls.clone();
        let fd = self.fd.as_ref().map(AsRawFd::as_raw_fd);
        // Listen before handing out the sequence, so connections queue up
        // from this point on even if the first advance comes later.
        let listening = match fd {
            Some(fd) => {
                let backlog = if backlog > 0 {
                    backlog as libc::c_int
                } else {
                    libc::SOMAXCONN
                };
                sys::net::listen(fd, backlog).map_err(|e| Error::io("listen", e))
            }
            None => Err(Error::io("listen", closed_error())),
        };
        async_generator(move |y| async move {
            listening?;
            let Some(fd) = fd else {
                return Err(Error::io("listen", closed_error()));
            };
            loop {
                match sys::net::accept(fd) {
                    Ok(raw) => {
                        // SAFETY: `accept` returned a fresh descriptor.
                        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                        let mut socket = Socket::new(service.clone(), owned);
                        if let Some(context) = &tls {
                            socket.attach_tls(context.session()?);
                        }
                        y.value(socket).await;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        Readiness::new(&service, fd, Interest::READABLE)
                            .await
                            .map_err(|e| Error::io("accept", e))?;
                    }
                    Err(err) if recoverable(&err) => {
                        trace!("skipping failed accept: {}", err);
                    }
                    Err(err) => return Err(Error::io("accept", err)),
                }
            }
        })
    }

    /// Stops listening. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let raw = fd.as_raw_fd();
        self.service.inner().cancel_fd(raw);
        let _ = sys::net::shutdown(raw);
        sys::net::close(fd.into_raw_fd()).map_err(|e| Error::io("close server", e))
    }

    /// The address the server is bound to, useful when binding port zero.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        let Some(fd) = &self.fd else {
            return Err(Error::io("server", closed_error()));
        };
        sys::net::local_addr(fd.as_raw_fd()).map_err(|e| Error::io("server", e))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn recoverable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNABORTED) | Some(libc::ECONNRESET) | Some(libc::EPROTO) | Some(libc::EINTR)
    )
}
