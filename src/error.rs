use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the runtime, the socket layer and the protocol
/// layers on top of them.
///
/// Transient conditions (`EAGAIN`, TLS wants-read/wants-write) never reach
/// this type; they are absorbed by the reactor loops below the socket
/// surface. An orderly peer close is not an error either: `recv` reports it
/// as zero bytes and `send` as `false`.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS level failure, tagged with the operation that hit it.
    #[error("{op}: {source}")]
    Io {
        /// Operation name, e.g. `"recv"` or `"bind"`.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A TLS protocol failure, tagged with the operation that hit it
    /// (`tls handshake`, `tls recv`, `tls send`).
    #[error("{op}: {source}")]
    Tls {
        /// Operation name.
        op: &'static str,
        /// The TLS library's error.
        #[source]
        source: rustls::Error,
    },

    /// The certificate bundle was missing a region or had them out of
    /// order.
    #[error("certificate bundle: {0}")]
    Certificate(&'static str),

    /// The HTTP request stream could not be parsed; the connection should
    /// be closed.
    #[error("http parse: {0}")]
    Parse(String),

    /// A task's coroutine was destroyed before it produced a value.
    #[error("broken promise")]
    BrokenPromise,

    /// The service was closed while the operation was pending.
    #[error("service closed")]
    Closed,
}

impl Error {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Error {
        Error::Io { op, source }
    }

    pub(crate) fn tls(op: &'static str, source: rustls::Error) -> Error {
        Error::Tls { op, source }
    }

    /// The raw OS error code, when the failure came from a syscall.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
