use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::http::{HeaderName, Method, Version};
use crate::net::Connection;
use crate::runtime::Event;

const MAX_HEADERS: usize = 32;

/// Frames a connection's byte stream into a sequence of [`Request`]s.
///
/// Runs the TLS handshake first (the sequence is empty when the peer
/// refuses it), then parses requests until the transport closes or a
/// parse failure ends the sequence. Each request's body must be consumed
/// through [`Request::body`] before advancing to the next request.
///
/// The framer only borrows the connection while it is actually receiving,
/// and it only receives while the caller is suspended in [`next`] or in a
/// body await. In between, responses can be sent through the same
/// connection handle.
///
/// [`next`]: RequestStream::next
pub fn recv(socket: Connection, size: usize) -> RequestStream {
    let shared = Rc::new(Shared {
        driver: RefCell::new(None),
        outcome: RefCell::new(None),
        request: RefCell::new(None),
    });
    let future = drive(socket, size, shared.clone());
    *shared.driver.borrow_mut() = Some(Box::pin(future));
    RequestStream { shared }
}

/// One parsed request.
///
/// The header section is fully materialized; the body streams through
/// [`body`]. `closed` flips when the transport closed underneath a
/// request that was already yielded.
///
/// [`body`]: Request::body
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: Version,
    /// Recognized headers, in wire order; a multimap, repeated names
    /// appear repeatedly.
    pub headers: Vec<(HeaderName, String)>,
    pub content_length: usize,
    pub keep_alive: bool,
    channel: Rc<BodyChannel>,
    shared: Rc<Shared>,
}

impl Request {
    /// The first value of a recognized header.
    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.as_str())
    }

    /// True once the transport closed mid-request; observed at the next
    /// body await, which returns empty.
    pub fn closed(&self) -> bool {
        self.channel.closed.get()
    }

    /// The body as an asynchronous sequence of chunks.
    ///
    /// Yields slices of the receive buffer as they arrive and ends after
    /// the final chunk. A zero-length body ends immediately. Only one
    /// body stream may be consumed per request.
    pub fn body(&self) -> Body {
        Body {
            channel: self.channel.clone(),
            shared: self.shared.clone(),
            ended: false,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {} {}", self.method, self.path, self.version)?;
        for (name, value) in &self.headers {
            write!(fmt, "\n{}: {}", name, value)?;
        }
        if self.content_length > 0 {
            write!(fmt, "\nContent-Length: {}", self.content_length)?;
        }
        write!(
            fmt,
            "\nConnection: {}",
            if self.keep_alive { "keep-alive" } else { "close" }
        )
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("content_length", &self.content_length)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

/// The request sequence produced by [`recv`].
pub struct RequestStream {
    shared: Rc<Shared>,
}

impl RequestStream {
    /// Resumes the framer until it yields the next request or the
    /// connection ends.
    pub async fn next(&mut self) -> Result<Option<Request>> {
        let shared = self.shared.clone();
        poll_fn(move |cx| {
            if let Some(request) = shared.request.borrow_mut().take() {
                return Poll::Ready(Ok(Some(request)));
            }
            match shared.poll_driver(cx) {
                Poll::Ready(()) => {
                    let outcome = shared.outcome.borrow_mut().take();
                    Poll::Ready(match outcome {
                        Some(Err(err)) => Err(err),
                        _ => Ok(None),
                    })
                }
                Poll::Pending => match shared.request.borrow_mut().take() {
                    Some(request) => Poll::Ready(Ok(Some(request))),
                    None => Poll::Pending,
                },
            }
        })
        .await
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        // Destroy the framer and any request still parked in the handoff
        // slot; both hold the shared state and would otherwise keep the
        // cycle alive. Outstanding bodies observe the missing driver as a
        // closed transport.
        self.shared.driver.borrow_mut().take();
        self.shared.request.borrow_mut().take();
    }
}

impl fmt::Debug for RequestStream {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RequestStream").finish_non_exhaustive()
    }
}

/// The body sequence of one request; see [`Request::body`].
pub struct Body {
    channel: Rc<BodyChannel>,
    shared: Rc<Shared>,
    ended: bool,
}

impl Body {
    /// Awaits the next chunk; `None` after the final one.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        if self.ended {
            return Ok(None);
        }
        let channel = self.channel.clone();
        let shared = self.shared.clone();
        let step = poll_fn(move |cx| loop {
            if channel.event.is_set() {
                channel.event.reset();
                let chunk = channel.chunk.borrow_mut().take().unwrap_or_default();
                if chunk.is_empty() {
                    return Poll::Ready(Ok(None));
                }
                return Poll::Ready(Ok(Some(chunk)));
            }
            match shared.poll_driver(cx) {
                Poll::Ready(()) => {
                    if channel.event.is_set() {
                        continue;
                    }
                    // The framer is gone without finishing this body: the
                    // transport closed underneath us.
                    channel.closed.set(true);
                    let outcome = shared.outcome.borrow_mut().take();
                    return Poll::Ready(match outcome {
                        Some(Err(err)) => Err(err),
                        _ => Ok(None),
                    });
                }
                Poll::Pending => {
                    if channel.event.is_set() {
                        continue;
                    }
                    return Poll::Pending;
                }
            }
        })
        .await;
        // The stream is over after the terminal empty chunk or a failure.
        if !matches!(step, Ok(Some(_))) {
            self.ended = true;
        }
        step
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Body")
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

/// State shared between the framer coroutine, the request stream and the
/// body streams. Whoever needs progress polls the one driver future; the
/// cooperative model serializes producer pause and consumer resume.
struct Shared {
    driver: RefCell<Option<Pin<Box<dyn Future<Output = Result<()>>>>>>,
    outcome: RefCell<Option<Result<()>>>,
    /// A parsed request parked until the stream consumer picks it up.
    request: RefCell<Option<Request>>,
}

impl Shared {
    fn poll_driver(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut slot = self.driver.borrow_mut();
        match slot.as_mut() {
            Some(future) => match future.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    *slot = None;
                    *self.outcome.borrow_mut() = Some(result);
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Ready(()),
        }
    }
}

/// Producer→consumer handoff channel; one per request.
struct BodyChannel {
    event: Event,
    chunk: RefCell<Option<Bytes>>,
    closed: Cell<bool>,
}

impl BodyChannel {
    fn new() -> BodyChannel {
        BodyChannel {
            event: Event::new(),
            chunk: RefCell::new(None),
            closed: Cell::new(false),
        }
    }

    /// Terminal empty chunk; never blocks the framer.
    fn finish(&self) {
        *self.chunk.borrow_mut() = Some(Bytes::new());
        self.event.set();
    }

    /// Transport closed mid-request.
    fn close(&self) {
        self.closed.set(true);
        self.finish();
    }
}

/// The framer coroutine.
async fn drive(socket: Connection, size: usize, shared: Rc<Shared>) -> Result<()> {
    if !socket.borrow_mut().handshake().await? {
        return Ok(());
    }
    let mut buffer = BytesMut::with_capacity(size);
    loop {
        // Head section; tolerates byte-at-a-time arrival.
        let head = loop {
            if let Some((head, consumed)) = parse_head(&buffer)? {
                let _ = buffer.split_to(consumed);
                break head;
            }
            if recv_into(&socket, &mut buffer, size).await? == 0 {
                // Transport closed between requests; an incomplete head
                // is dropped without a request, like the original stream.
                return Ok(());
            }
        };

        let channel = Rc::new(BodyChannel::new());
        let mut remaining = head.content_length;
        let request = Request {
            method: head.method,
            path: head.path,
            version: head.version,
            headers: head.headers,
            content_length: head.content_length,
            keep_alive: head.keep_alive,
            channel: channel.clone(),
            shared: shared.clone(),
        };
        YieldRequest {
            shared: &shared,
            request: Some(request),
        }
        .await;

        while remaining > 0 {
            if buffer.is_empty() && recv_into(&socket, &mut buffer, size).await? == 0 {
                channel.close();
                return Ok(());
            }
            let take = remaining.min(buffer.len());
            let chunk = buffer.split_to(take).freeze();
            remaining -= take;
            PostChunk {
                channel: &channel,
                chunk: Some(chunk),
            }
            .await;
        }
        channel.finish();
        // Hand control back before touching the socket again, so the
        // consumer can answer this request through the shared connection
        // while no receive borrow is outstanding.
        pause().await;
    }
}

/// Receives into the accumulation buffer's tail; the body slices handed
/// to consumers share this allocation, no further copies happen.
async fn recv_into(socket: &Connection, buffer: &mut BytesMut, size: usize) -> Result<usize> {
    let len = buffer.len();
    buffer.resize(len + size, 0);
    let n = socket.borrow_mut().recv(&mut buffer[len..]).await?;
    buffer.truncate(len + n);
    Ok(n)
}

/// Yields once to the poller.
async fn pause() {
    let mut paused = false;
    poll_fn(move |cx| {
        if paused {
            Poll::Ready(())
        } else {
            paused = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await
}

struct Head {
    method: Method,
    path: String,
    version: Version,
    headers: Vec<(HeaderName, String)>,
    content_length: usize,
    keep_alive: bool,
}

fn parse_head(buffer: &[u8]) -> Result<Option<(Head, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let consumed = match parsed.parse(buffer) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(Error::Parse(err.to_string())),
    };

    let method = Method::from_token(parsed.method.unwrap_or(""));
    let version = Version {
        major: 1,
        minor: u16::from(parsed.version.unwrap_or(0)),
    };

    // Path accumulates up to an optional query separator.
    let target = parsed.path.unwrap_or("");
    let path = match target.find('?') {
        Some(at) => target[..at].to_string(),
        None => target.to_string(),
    };

    let mut recognized = Vec::new();
    let mut content_length = 0usize;
    let mut connection = None;
    for header in parsed.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| Error::Parse("invalid content-length".into()))?;
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection = Some(value.to_string());
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(Error::Parse("transfer-encoding not supported".into()));
        } else if let Some(name) = HeaderName::from_name(header.name) {
            recognized.push((name, value.into_owned()));
        }
    }

    // RFC 7230 defaults: 1.1 is persistent unless told otherwise, 1.0
    // only on request.
    let keep_alive = match &connection {
        Some(value) => {
            let mut tokens = value.split(',').map(str::trim);
            if version.minor >= 1 {
                !tokens.any(|token| token.eq_ignore_ascii_case("close"))
            } else {
                tokens.any(|token| token.eq_ignore_ascii_case("keep-alive"))
            }
        }
        None => version.minor >= 1,
    };

    Ok(Some((
        Head {
            method,
            path,
            version,
            headers: recognized,
            content_length,
            keep_alive,
        },
        consumed,
    )))
}

/// Parks the framer until the stream consumer picks the request up.
struct YieldRequest<'s> {
    shared: &'s Rc<Shared>,
    request: Option<Request>,
}

impl Future for YieldRequest<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: no field is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        match this.request.take() {
            Some(request) => {
                *this.shared.request.borrow_mut() = Some(request);
                Poll::Pending
            }
            None => {
                if this.shared.request.borrow().is_some() {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            }
        }
    }
}

/// Parks the framer until the posted chunk is consumed, the implicit
/// backpressure that keeps it from reading ahead of the body consumer.
struct PostChunk<'c> {
    channel: &'c Rc<BodyChannel>,
    chunk: Option<Bytes>,
}

impl Future for PostChunk<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: no field is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        match this.chunk.take() {
            Some(chunk) => {
                *this.channel.chunk.borrow_mut() = Some(chunk);
                this.channel.event.set();
                Poll::Pending
            }
            None => {
                if this.channel.event.is_set() || this.channel.chunk.borrow().is_some() {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_head() {
        let bytes = b"GET /x?q=1 HTTP/1.1\r\nHost: a\r\nCookie: k=v\r\n\r\n";
        let (head, consumed) = parse_head(bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.path, "/x");
        assert_eq!(head.version, Version { major: 1, minor: 1 });
        assert!(head.keep_alive);
        assert_eq!(head.content_length, 0);
        assert_eq!(head.headers, vec![(HeaderName::Cookie, "k=v".to_string())]);
    }

    #[test]
    fn partial_head_asks_for_more() {
        assert!(parse_head(b"GET / HT").unwrap().is_none());
    }

    #[test]
    fn connection_close_clears_keep_alive() {
        let bytes = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let (head, _) = parse_head(bytes).unwrap().unwrap();
        assert!(!head.keep_alive);
    }

    #[test]
    fn http_10_defaults_to_close() {
        let (head, _) = parse_head(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!head.keep_alive);
        let (head, _) = parse_head(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.keep_alive);
    }

    #[test]
    fn invalid_content_length_is_a_parse_failure() {
        let result = parse_head(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n");
        assert!(matches!(result, Err(Error::Parse(_))));
    }
}
