//! Minimal HTTP/1.x server over the request framer.
//!
//! Usage: `http_server [host [port [cert [alpn]]]]`
//!
//! Logs each request line, drains the body and answers with a fixed
//! payload. SIGINT closes the service; exit code 1 on unhandled failure.

use std::cell::RefCell;
use std::rc::Rc;

use log::{error, info};

use corio::http;
use corio::net::{Kind, Server, Socket};
use corio::Service;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok";

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    let host = args.get(1).map_or("0.0.0.0", String::as_str).to_string();
    let port = args.get(2).map_or("8080", String::as_str).to_string();
    let cert = args.get(3).cloned();
    let alpn = args.get(4).cloned();

    if let Err(err) = run(host, port, cert, alpn) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn run(host: String, port: String, cert: Option<String>, alpn: Option<String>) -> corio::Result<()> {
    let service = Service::new()?;

    let closer = service.closer();
    corio::signal::trap(libc::SIGINT, move || closer.close())?;
    corio::signal::ignore(libc::SIGPIPE)?;

    let mut server = Server::create(&service, &host, &port, Kind::Tcp)?;
    if let Some(cert) = &cert {
        server.configure(cert, alpn.as_deref())?;
    }

    // Binding and the certificate are done with; shed root before any
    // peer data is handled. No-op for unprivileged runs.
    corio::process::drop_privileges("nobody")?;

    let session_service = service.clone();
    service
        .spawn(async move {
            let mut accept = server.accept(0);
            // Per-connection failures are logged in the session task; only
            // accept failures end this loop.
            while let Some(socket) = accept.next().await? {
                session_service.spawn(session(socket)).detach();
            }
            Ok(())
        })
        .detach();

    info!("{}:{}", host, port);
    service.run(-1)
}

async fn session(socket: Socket) -> corio::Result<()> {
    let socket = Rc::new(RefCell::new(socket));
    let result = serve(&socket).await;
    if let Err(err) = &result {
        error!("session: {}", err);
    }
    result
}

async fn serve(socket: &corio::net::Connection) -> corio::Result<()> {
    let mut requests = http::recv(socket.clone(), 4096);
    while let Some(request) = requests.next().await? {
        info!("{} {} {}", request.method, request.path, request.version);

        // Drain the body before answering; the framer will not advance
        // past an unconsumed chunk.
        let mut body = request.body();
        let mut received = 0;
        while let Some(chunk) = body.next().await? {
            received += chunk.len();
        }
        if received > 0 {
            info!("request body: {} bytes", received);
        }
        if request.closed() {
            return Ok(());
        }

        if !socket.borrow_mut().send(RESPONSE).await? {
            return Ok(());
        }
        if !request.keep_alive {
            return Ok(());
        }
    }
    Ok(())
}
