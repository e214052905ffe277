//! TCP/TLS echo server.
//!
//! Usage: `echo_server [host [port [cert [alpn]]]]`
//!
//! With a certificate bundle every connection is wrapped in TLS. Probe it
//! with e.g. `openssl s_client -alpn h2 -connect 127.0.0.1:8080`.

use log::{error, info};

use corio::net::{Kind, Server, Socket, SocketOption};
use corio::Service;

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
            // Per-connection failures are logged, the loop keeps
            // accepting; only accept failures end it.
            while let Some(socket) = accept.next().await? {
                if let Ok(peer) = socket.peer() {
                    info!("{} connected", peer);
                }
                if let Err(err) = socket.set(SocketOption::Nodelay, true) {
                    error!("set nodelay: {}", err);
                }
                session_service.spawn(session(socket)).detach();
            }
            Ok(())
        })
        .detach();

    info!("{}:{}", host, port);
    service.run(-1)
}

async fn session(mut socket: Socket) -> corio::Result<()> {
    if !socket.handshake().await? {
        return Ok(());
    }
    if let Some(alpn) = socket.alpn() {
        info!("negotiated {}", alpn);
    }
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) => {
                error!("session: {}", err);
                return Err(err);
            }
        };
        if !socket.send(&buf[..n]).await? {
            return Ok(());
        }
    }
}
