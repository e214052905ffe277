//! HTTP/1.x request framing.
//!
//! [`recv`] turns a socket's byte stream into a sequence of [`Request`]s.
//! Headers are fully materialized before a request is yielded; the body is
//! streamed to the consumer through the request's single-consumer event,
//! one chunk at a time, without copying out of the receive buffer. While a
//! chunk is outstanding the framer reads no new bytes from the socket.

mod framer;

use std::fmt;

pub use self::framer::{recv, Body, Request, RequestStream};

/// Request method. Unrecognized methods parse as `None`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    None,
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub(crate) fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            _ => Method::None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::None => "NONE",
        };
        fmt.write_str(name)
    }
}

/// Protocol version of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// The header fields a request retains. Everything else is parsed and
/// discarded; `Content-Length` and `Connection` only influence framing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HeaderName {
    AcceptEncoding,
    CacheControl,
    ContentType,
    Cookie,
    IfModifiedSince,
    Range,
}

impl HeaderName {
    /// Case-insensitive match against the recognized set.
    pub(crate) fn from_name(name: &str) -> Option<HeaderName> {
        const RECOGNIZED: &[(&str, HeaderName)] = &[
            ("accept-encoding", HeaderName::AcceptEncoding),
            ("cache-control", HeaderName::CacheControl),
            ("content-type", HeaderName::ContentType),
            ("cookie", HeaderName::Cookie),
            ("if-modified-since", HeaderName::IfModifiedSince),
            ("range", HeaderName::Range),
        ];
        RECOGNIZED
            .iter()
            .find(|(canonical, _)| name.eq_ignore_ascii_case(canonical))
            .map(|(_, header)| *header)
    }

    pub fn canonical(&self) -> &'static str {
        match self {
            HeaderName::AcceptEncoding => "Accept-Encoding",
            HeaderName::CacheControl => "Cache-Control",
            HeaderName::ContentType => "Content-Type",
            HeaderName::Cookie => "Cookie",
            HeaderName::IfModifiedSince => "If-Modified-Since",
            HeaderName::Range => "Range",
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_match_case_insensitively() {
        assert_eq!(
            HeaderName::from_name("Accept-Encoding"),
            Some(HeaderName::AcceptEncoding)
        );
        assert_eq!(HeaderName::from_name("RANGE"), Some(HeaderName::Range));
        assert_eq!(HeaderName::from_name("x-custom"), None);
    }

    #[test]
    fn unknown_method_parses_as_none() {
        assert_eq!(Method::from_token("PATCH"), Method::None);
        assert_eq!(Method::from_token("GET"), Method::Get);
    }
}
