//! Whole-stack scenarios over loopback TCP.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use rand::RngCore;

use corio::net::{Family, Kind, Server, Socket};
use corio::Service;

/// The listener goes live on the service thread; retry until it does.
fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    panic!("server never started listening");
}

#[test]
fn echo_round_trip() {
    let mut payload = vec![0u8; 256 * 1024];
    rand::rng().fill_bytes(&mut payload);

    let service = Service::new().unwrap();
    let mut server = Server::create(&service, "127.0.0.1", "0", Kind::Tcp).unwrap();
    let port = server.local_addr().unwrap().port();

    let expected = payload.clone();
    let client = thread::spawn(move || {
        let mut stream = connect(port);
        let writer_payload = payload;
        let mut write_half = stream.try_clone().expect("clone");
        let writer = thread::spawn(move || {
            write_half.write_all(&writer_payload).expect("write");
            write_half.shutdown(Shutdown::Write).expect("shutdown");
        });
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).expect("read");
        writer.join().expect("writer thread");
        echoed
    });

    service
        .block_on(async move {
            let mut accept = server.accept(0);
            let mut socket = accept.next().await?.expect("one connection");
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.recv(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                if !socket.send(&buf[..n]).await? {
                    return Ok(());
                }
            }
        })
        .unwrap();

    let echoed = client.join().expect("client thread");
    assert_eq!(echoed, expected);
}

#[test]
fn recv_stream_ends_on_orderly_close() {
    let service = Service::new().unwrap();
    let mut server = Server::create(&service, "127.0.0.1", "0", Kind::Tcp).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = thread::spawn(move || {
        let mut stream = connect(port);
        stream.write_all(b"some bytes").expect("write");
        stream.shutdown(Shutdown::Write).expect("shutdown");
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    let received = service
        .block_on(async move {
            let mut accept = server.accept(0);
            let mut socket = accept.next().await?.expect("one connection");
            let mut received = Vec::new();
            let mut chunks = socket.recv_stream(4096);
            while let Some(chunk) = chunks.next().await? {
                received.extend_from_slice(&chunk);
            }
            Ok(received)
        })
        .unwrap();
    client.join().expect("client thread");
    assert_eq!(received, b"some bytes");
}

#[test]
fn every_connection_is_accepted_exactly_once() {
    const CONNECTIONS: usize = 1000;

    let service = Service::new().unwrap();
    let mut server = Server::create(&service, "127.0.0.1", "0", Kind::Tcp).unwrap();
    let port = server.local_addr().unwrap().port();

    let clients = thread::spawn(move || {
        for i in 0..CONNECTIONS {
            let mut stream = connect(port);
            let index = (i as u32).to_be_bytes();
            stream.write_all(&index).expect("write");
            stream.shutdown(Shutdown::Write).expect("shutdown");
        }
    });

    let mut seen = service
        .block_on(async move {
            let mut accept = server.accept(128);
            let mut seen = Vec::with_capacity(CONNECTIONS);
            while seen.len() < CONNECTIONS {
                let mut socket = accept.next().await?.expect("accept stream ended");
                let mut index = [0u8; 4];
                let mut filled = 0;
                while filled < index.len() {
                    let n = socket.recv(&mut index[filled..]).await?;
                    assert_ne!(n, 0, "client closed early");
                    filled += n;
                }
                seen.push(u32::from_be_bytes(index));
            }
            Ok(seen)
        })
        .unwrap();
    clients.join().expect("client thread");

    seen.sort_unstable();
    assert_eq!(seen.len(), CONNECTIONS);
    for (expected, got) in seen.iter().enumerate() {
        assert_eq!(*got, expected as u32, "duplicate or dropped connection");
    }
}

#[test]
fn socket_close_is_idempotent() {
    let service = Service::new().unwrap();
    let mut socket = Socket::create(&service, Family::Ipv4, Kind::Tcp).unwrap();
    assert!(socket.close().is_ok());
    assert!(socket.close().is_ok());
    assert!(socket.close().is_ok());
}

#[test]
fn udp_sockets_come_from_the_same_factory() {
    let service = Service::new().unwrap();
    let mut socket = Socket::create(&service, Family::Ipv4, Kind::Udp).unwrap();
    assert!(socket.close().is_ok());
}
