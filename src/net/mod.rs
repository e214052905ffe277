//! The socket layer: suspending sockets and the accepting server.

use std::cell::RefCell;
use std::rc::Rc;

mod server;
mod socket;

pub use self::server::Server;
pub use self::socket::{Family, Kind, Socket, SocketOption};

pub(crate) use self::socket::{native_recv, native_send};

/// A shared handle to a socket, for the cases where one connection is
/// consumed and written by different parties: the HTTP framer receives
/// through it while the application answers through it.
pub type Connection = Rc<RefCell<Socket>>;
