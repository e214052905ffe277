//! Request framing over real loopback connections.

use std::cell::RefCell;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use corio::http::{self, HeaderName, Method, Version};
use corio::net::{Kind, Server};
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

/// What one request looked like once fully consumed.
#[derive(Debug)]
struct Collected {
    method: Method,
    path: String,
    version: Version,
    keep_alive: bool,
    content_length: usize,
    cookie: Option<String>,
    body: Vec<u8>,
    closed: bool,
}

/// Serves exactly one connection whose bytes arrive in `parts` (with a
/// short gap between parts) and returns the requests it framed.
fn collect(parts: Vec<Vec<u8>>) -> corio::Result<Vec<Collected>> {
    let service = Service::new()?;
    let mut server = Server::create(&service, "127.0.0.1", "0", Kind::Tcp)?;
    let port = server.local_addr()?.port();

    let client = thread::spawn(move || {
        let mut stream = connect(port);
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                thread::sleep(Duration::from_millis(20));
            }
            stream.write_all(part).expect("write");
        }
        stream.shutdown(Shutdown::Write).expect("shutdown");
    });

    let result = service.block_on(async move {
        let mut accept = server.accept(0);
        let socket = match accept.next().await? {
            Some(socket) => socket,
            None => return Ok(Vec::new()),
        };
        let socket = Rc::new(RefCell::new(socket));
        let mut requests = http::recv(socket, 512);
        let mut collected = Vec::new();
        while let Some(request) = requests.next().await? {
            let mut body = request.body();
            let mut bytes = Vec::new();
            while let Some(chunk) = body.next().await? {
                bytes.extend_from_slice(&chunk);
            }
            collected.push(Collected {
                method: request.method,
                path: request.path.clone(),
                version: request.version,
                keep_alive: request.keep_alive,
                content_length: request.content_length,
                cookie: request.header(HeaderName::Cookie).map(str::to_string),
                body: bytes,
                closed: request.closed(),
            });
        }
        Ok(collected)
    });
    client.join().expect("client thread");
    result
}

#[test]
fn plain_get() {
    let requests = collect(vec![b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n".to_vec()]).unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.path, "/x");
    assert_eq!(request.version, Version { major: 1, minor: 1 });
    assert!(request.keep_alive);
    assert_eq!(request.content_length, 0);
    assert!(request.body.is_empty());
    assert!(!request.closed);
}

#[test]
fn post_with_content_length() {
    let requests = collect(vec![
        b"POST /y HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
    ])
    .unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.content_length, 5);
    assert_eq!(request.body, b"hello");
}

#[test]
fn pipelined_requests_arrive_in_order() {
    let requests = collect(vec![
        b"GET /first HTTP/1.1\r\nHost: a\r\n\r\nGET /second HTTP/1.1\r\nHost: a\r\n\r\n".to_vec(),
    ])
    .unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path, "/first");
    assert_eq!(requests[1].path, "/second");
}

#[test]
fn tolerates_fragmented_arrival() {
    let requests = collect(vec![
        b"POST /z HTT".to_vec(),
        b"P/1.1\r\nCookie: k=v\r\nContent-Le".to_vec(),
        b"ngth: 4\r\n\r\nab".to_vec(),
        b"cd".to_vec(),
    ])
    .unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.path, "/z");
    assert_eq!(request.cookie.as_deref(), Some("k=v"));
    assert_eq!(request.body, b"abcd");
}

#[test]
fn close_mid_body_flags_the_request() {
    let requests = collect(vec![
        b"POST /w HTTP/1.1\r\nContent-Length: 10\r\n\r\nhal".to_vec(),
    ])
    .unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.closed);
    assert_eq!(request.body, b"hal");
}

#[test]
fn responses_interleave_with_framing() {
    use std::io::Read;

    let service = Service::new().unwrap();
    let mut server = Server::create(&service, "127.0.0.1", "0", Kind::Tcp).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = thread::spawn(move || {
        let mut stream = connect(port);
        stream
            .write_all(b"GET /a HTTP/1.1\r\nHost: a\r\n\r\nGET /b HTTP/1.1\r\nHost: a\r\n\r\n")
            .expect("write");
        stream.shutdown(Shutdown::Write).expect("shutdown");
        let mut replies = String::new();
        stream.read_to_string(&mut replies).expect("read");
        replies
    });

    service
        .block_on(async move {
            let mut accept = server.accept(0);
            let socket = accept.next().await?.expect("one connection");
            let socket = Rc::new(RefCell::new(socket));
            let mut requests = http::recv(socket.clone(), 512);
            while let Some(request) = requests.next().await? {
                let mut body = request.body();
                while body.next().await?.is_some() {}
                let reply = format!("echo {}\n", request.path);
                socket.borrow_mut().send(reply.as_bytes()).await?;
            }
            Ok(())
        })
        .unwrap();

    let replies = client.join().expect("client thread");
    assert_eq!(replies, "echo /a\necho /b\n");
}
