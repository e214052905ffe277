//! A single-threaded asynchronous TCP/TLS server runtime.
//!
//! corio layers three pieces on top of the OS readiness selectors (epoll
//! on Linux and Android, kqueue on the BSDs and macOS):
//!
//! * a cooperative coroutine runtime: spawned [`Task`]s, synchronous and
//!   asynchronous generators, a strictly-FIFO [`AsyncMutex`] and a
//!   single-consumer [`Event`];
//! * a socket layer whose `recv`/`send`/`accept` suspend on the selector
//!   instead of blocking the thread;
//! * a TLS bridge that adapts rustls' transport model to the reactor,
//!   plus an HTTP/1.x framer that streams request bodies into consumer
//!   coroutines without extra copies.
//!
//! Everything runs on the thread that calls [`Service::run`] (or
//! [`Service::block_on`]); there is no work stealing and no cross-thread
//! resume.
//!
//! # Examples
//!
//! An echo server:
//!
//! ```no_run
//! use corio::net::{Kind, Server};
//! use corio::Service;
//!
//! fn main() -> corio::Result<()> {
//!     let service = Service::new()?;
//!     let accept_service = service.clone();
//!     service
//!         .spawn(async move {
//!             let mut server = Server::create(&accept_service, "127.0.0.1", "8080", Kind::Tcp)?;
//!             let mut accept = server.accept(0);
//!             while let Some(mut socket) = accept.next().await? {
//!                 accept_service
//!                     .spawn(async move {
//!                         let mut buf = [0u8; 4096];
//!                         loop {
//!                             let n = socket.recv(&mut buf).await?;
//!                             if n == 0 || !socket.send(&buf[..n]).await? {
//!                                 return Ok(());
//!                             }
//!                         }
//!                     })
//!                     .detach();
//!             }
//!             Ok(())
//!         })
//!         .detach();
//!     service.run(-1)
//! }
//! ```

#![warn(missing_debug_implementations)]

mod error;
mod interest;
mod service;
mod sys;
mod token;

pub mod http;
pub mod net;
pub mod process;
pub mod runtime;
pub mod signal;
pub mod tls;

pub use crate::error::{Error, Result};
pub use crate::runtime::{AsyncGenerator, AsyncMutex, Event, Generator, Task};
pub use crate::service::{Closer, Service};
