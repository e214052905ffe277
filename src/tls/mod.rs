//! The TLS bridge.
//!
//! rustls never touches the descriptor: it reports `wants_read` /
//! `wants_write` and hands records through `read_tls`/`write_tls`. The
//! bridge maps those onto the reactor the same way the readiness codes of
//! a descriptor-owning TLS library would be mapped: a want-write captures
//! the outgoing records into a pending buffer that is flushed natively in
//! full before the TLS call is retried; a want-read is serviced by exactly
//! one native read into the session's scratch buffer. Native I/O is never
//! overlapped within one direction.

mod cert;

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::trace;

use crate::error::{Error, Result};
use crate::net::{native_recv, native_send};
use crate::service::Service;

pub(crate) use self::cert::CertificateBundle;

/// Size of the per-session scratch buffer want-reads are serviced into.
const RECV_SCRATCH: usize = 2048;

/// A server-side TLS configuration, built once per [`Server`] and cloned
/// into a fresh session for every accepted socket.
///
/// [`Server`]: crate::net::Server
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<rustls::ServerConfig>,
}

impl TlsContext {
    /// Builds the context from a PEM bundle laid out as: PKCS#1 RSA
    /// private key, leaf certificate, CA chain, in that order.
    ///
    /// The default provider already prefers the AEAD suites with
    /// ChaCha20 in the mix, and rustls always applies the server's
    /// cipher preference.
    pub fn load(certificate: &str, alpn: Option<&str>) -> Result<TlsContext> {
        let bundle = CertificateBundle::open(certificate)?;
        let (key, chain) = bundle.decode()?;
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::tls("tls configure", e))?;
        if let Some(alpn) = alpn {
            config.alpn_protocols = alpn
                .split(',')
                .map(|proto| proto.trim().as_bytes().to_vec())
                .filter(|proto| !proto.is_empty())
                .collect();
        }
        Ok(TlsContext {
            config: Arc::new(config),
        })
    }

    /// A fresh per-connection session.
    pub(crate) fn session(&self) -> Result<TlsSession> {
        let conn = rustls::ServerConnection::new(self.config.clone())
            .map_err(|e| Error::tls("tls accept", e))?;
        Ok(TlsSession {
            conn,
            alpn: None,
            scratch: vec![0; RECV_SCRATCH].into_boxed_slice(),
            pending: Vec::new(),
            peer_closed: false,
        })
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// Per-connection TLS state: the rustls connection plus the transport
/// scratch the bridge shuttles records through.
pub(crate) struct TlsSession {
    conn: rustls::ServerConnection,
    alpn: Option<String>,
    scratch: Box<[u8]>,
    /// Captured outgoing records not yet written natively. Must drain in
    /// full before the next TLS call.
    pending: Vec<u8>,
    peer_closed: bool,
}

impl TlsSession {
    /// Drives the handshake to completion. Returns `false` when the peer
    /// closed mid-handshake.
    pub(crate) async fn handshake(&mut self, service: &Service, fd: RawFd) -> Result<bool> {
        while self.conn.is_handshaking() {
            if !self.flush(service, fd, "tls handshake").await? {
                return Ok(false);
            }
            if !self.conn.is_handshaking() {
                break;
            }
            if self.conn.wants_read() && !self.advance(service, fd, "tls handshake").await? {
                return Ok(false);
            }
        }
        // Flush the final flight before reporting success.
        if !self.flush(service, fd, "tls handshake").await? {
            return Ok(false);
        }
        self.alpn = self
            .conn
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned());
        trace!("tls handshake complete, alpn {:?}", self.alpn);
        Ok(true)
    }

    /// The ALPN protocol cached by [`handshake`].
    ///
    /// [`handshake`]: TlsSession::handshake
    pub(crate) fn alpn(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    pub(crate) async fn recv(
        &mut self,
        service: &Service,
        fd: RawFd,
        buf: &mut [u8],
    ) -> Result<usize> {
        use std::io::Read;
        loop {
            if !self.flush(service, fd, "tls recv").await? {
                return Ok(0);
            }
            match self.conn.reader().read(buf) {
                // Zero means close_notify: an orderly TLS close.
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if self.peer_closed || !self.advance(service, fd, "tls recv").await? {
                        return Ok(0);
                    }
                }
                Err(err) => return Err(Error::io("tls recv", err)),
            }
        }
    }

    pub(crate) async fn send(&mut self, service: &Service, fd: RawFd, data: &[u8]) -> Result<bool> {
        use std::io::Write;
        let mut offset = 0;
        while offset < data.len() {
            let n = self
                .conn
                .writer()
                .write(&data[offset..])
                .map_err(|e| Error::io("tls send", e))?;
            offset += n;
            if !self.flush(service, fd, "tls send").await? {
                return Ok(false);
            }
        }
        self.flush(service, fd, "tls send").await
    }

    /// Sends close_notify with a single best-effort native write; the
    /// close path must not suspend.
    pub(crate) fn shutdown(&mut self, fd: RawFd) {
        self.conn.send_close_notify();
        let mut records = std::mem::take(&mut self.pending);
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut records).is_err() {
                break;
            }
        }
        if !records.is_empty() {
            let _ = crate::sys::net::send(fd, &records);
        }
    }

    /// Write side of the bridge: capture records into the pending buffer
    /// and drain it in full before returning. `false` means the peer
    /// closed underneath the send.
    async fn flush(&mut self, service: &Service, fd: RawFd, op: &'static str) -> Result<bool> {
        loop {
            if self.pending.is_empty() {
                if !self.conn.wants_write() {
                    return Ok(true);
                }
                self.conn
                    .write_tls(&mut self.pending)
                    .map_err(|e| Error::io(op, e))?;
                if self.pending.is_empty() {
                    return Ok(true);
                }
            }
            let records = std::mem::take(&mut self.pending);
            if !native_send(service, fd, &records).await? {
                return Ok(false);
            }
        }
    }

    /// Read side of the bridge: exactly one native read feeds the
    /// session, then the packets are processed. `false` means the
    /// transport hit end of stream.
    async fn advance(&mut self, service: &Service, fd: RawFd, op: &'static str) -> Result<bool> {
        let n = native_recv(service, fd, &mut self.scratch).await?;
        if n == 0 {
            self.peer_closed = true;
            return Ok(false);
        }
        let mut records = &self.scratch[..n];
        while !records.is_empty() {
            let read = self.conn.read_tls(&mut records).map_err(|e| Error::io(op, e))?;
            if read == 0 {
                break;
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| Error::tls(op, e))?;
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }
        Ok(true)
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TlsSession")
            .field("alpn", &self.alpn)
            .field("peer_closed", &self.peer_closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};

    use crate::Service;

    /// Accepts whatever certificate the server presents; these tests
    /// exercise the bridge, not trust decisions.
    #[derive(Debug)]
    struct AcceptAnything;

    impl ServerCertVerifier for AcceptAnything {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    /// A context around a freshly generated self-signed certificate,
    /// sidestepping the PEM bundle loader (covered by its own tests).
    fn test_context(alpn: Option<&str>) -> TlsContext {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate certificate");
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .expect("server config");
        if let Some(alpn) = alpn {
            config.alpn_protocols = alpn
                .split(',')
                .map(|proto| proto.trim().as_bytes().to_vec())
                .collect();
        }
        TlsContext {
            config: Arc::new(config),
        }
    }

    /// A connected pair: a non-blocking end for the session under test
    /// and a blocking end for the in-process client.
    fn socketpair() -> (OwnedFd, UnixStream) {
        let mut fds = [-1 as libc::c_int; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "socketpair failed");
        // SAFETY: both descriptors are fresh and owned below.
        let server = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let client = unsafe { UnixStream::from_raw_fd(fds[1]) };
        let rc = unsafe { libc::fcntl(server.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
        assert_eq!(rc, 0, "set nonblocking failed");
        (server, client)
    }

    /// Blocking rustls client on its own thread: handshakes offering only
    /// `http/1.1`, sends `ping`, expects `pong`.
    fn run_client(mut sock: UnixStream) -> thread::JoinHandle<(Option<Vec<u8>>, [u8; 4])> {
        thread::spawn(move || {
            let mut config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnything))
                .with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            let name = ServerName::try_from("localhost").expect("server name");
            let mut conn = ClientConnection::new(Arc::new(config), name).expect("client");
            while conn.is_handshaking() {
                conn.complete_io(&mut sock).expect("client handshake");
            }
            let alpn = conn.alpn_protocol().map(|proto| proto.to_vec());
            let mut tls = rustls::Stream::new(&mut conn, &mut sock);
            tls.write_all(b"ping").expect("client write");
            let mut pong = [0u8; 4];
            tls.read_exact(&mut pong).expect("client read");
            (alpn, pong)
        })
    }

    #[test]
    fn handshake_selects_alpn_and_moves_data() {
        let service = Service::new().unwrap();
        let context = test_context(Some("h2,http/1.1"));
        let (server_end, client_end) = socketpair();
        let client = run_client(client_end);

        let inner = service.clone();
        let alpn = service
            .block_on(async move {
                let fd = server_end.as_raw_fd();
                let mut session = context.session()?;
                assert!(session.handshake(&inner, fd).await?);
                let mut ping = [0u8; 4];
                let mut got = 0;
                while got < ping.len() {
                    let n = session.recv(&inner, fd, &mut ping[got..]).await?;
                    assert_ne!(n, 0, "client closed early");
                    got += n;
                }
                assert_eq!(&ping, b"ping");
                assert!(session.send(&inner, fd, b"pong").await?);
                Ok(session.alpn().map(str::to_string))
            })
            .unwrap();

        let (client_alpn, pong) = client.join().expect("client thread");
        // The client offered only http/1.1 out of the server's
        // h2,http/1.1 preference list; both sides agree on it.
        assert_eq!(alpn.as_deref(), Some("http/1.1"));
        assert_eq!(client_alpn.as_deref(), Some(&b"http/1.1"[..]));
        assert_eq!(&pong, b"pong");
    }

    #[test]
    fn handshake_without_alpn_reports_none() {
        let service = Service::new().unwrap();
        let context = test_context(None);
        let (server_end, client_end) = socketpair();
        let client = run_client(client_end);

        let inner = service.clone();
        let alpn = service
            .block_on(async move {
                let fd = server_end.as_raw_fd();
                let mut session = context.session()?;
                assert!(session.handshake(&inner, fd).await?);
                let mut ping = [0u8; 4];
                let mut got = 0;
                while got < ping.len() {
                    let n = session.recv(&inner, fd, &mut ping[got..]).await?;
                    assert_ne!(n, 0, "client closed early");
                    got += n;
                }
                assert!(session.send(&inner, fd, b"pong").await?);
                Ok(session.alpn().map(str::to_string))
            })
            .unwrap();

        let (client_alpn, _) = client.join().expect("client thread");
        assert_eq!(alpn, None);
        assert_eq!(client_alpn, None);
    }
}
