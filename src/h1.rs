//! Minimal HTTP/1.1 pipeline: request-line and header parsing, keep-alive
//! negotiation, pipelining, and response serialization.

use std::fmt::{self, Debug, Display};
use std::io::{self, Write};
use std::str;

use crate::conn::Flags;
use crate::pipeline::{ConnIo, Pipeline, ReadBuffer, Request};

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.6
    Connect,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
}

impl Method {
    fn from_token(token: &[u8]) -> Option<Method> {
        match token {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"CONNECT" => Some(Method::Connect),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            _ => None,
        }
    }
}

/// Representation of the requested HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

/// A single request header, borrowing from the read buffer.
#[derive(Debug)]
pub struct Header<'b> {
    /// Field name.
    pub name: &'b str,
    /// Field value with surrounding whitespace trimmed.
    pub value: &'b [u8],
}

/// A parsed request head, borrowing from the read buffer.
#[derive(Debug)]
pub struct RequestHead<'b> {
    /// Request method.
    pub method: Method,
    /// Request target.
    pub target: &'b str,
    /// Protocol version.
    pub version: Version,
    /// Headers in wire order.
    pub headers: Vec<Header<'b>>,
}

impl RequestHead<'_> {
    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value)
    }
}

/// Represents possible failures while parsing
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid byte in method.
    Method,
    /// Invalid byte in target.
    Target,
    /// Invalid HTTP version.
    Version,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid or missing new line.
    NewLine,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid token in target",
            ParseError::Version => "Invalid version",
            ParseError::HeaderName => "Invalid token in header name",
            ParseError::HeaderValue => "Invalid token in header value",
            ParseError::NewLine => "Invalid or missing new line",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// RFC 9110 tchar.
fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

fn is_target_byte(b: u8) -> bool {
    b > b' ' && b != 0x7f
}

/// Parse one request from `buf`. Returns the head and the number of bytes it
/// consumed (including any `Content-Length` body), or `None` when more bytes
/// are needed for a complete request.
pub fn parse(buf: &[u8]) -> Result<Option<(RequestHead<'_>, usize)>, ParseError> {
    let Some(head_end) = find_head_end(buf) else {
        return Ok(None);
    };

    // Keep the final header line's CRLF, drop only the blank terminator.
    let mut lines = buf[..head_end - 2].split(|&b| b == b'\n');
    let request_line = lines.next().ok_or(ParseError::NewLine)?;
    let request_line = strip_cr(request_line)?;

    let mut parts = request_line.split(|&b| b == b' ');
    let method = parts
        .next()
        .and_then(Method::from_token)
        .ok_or(ParseError::Method)?;

    let target = parts.next().ok_or(ParseError::Target)?;
    if target.is_empty() || !target.iter().all(|&b| is_target_byte(b)) {
        return Err(ParseError::Target);
    }
    // Target bytes are printable ASCII, checked above.
    let target = str::from_utf8(target).map_err(|_| ParseError::Target)?;

    let version = match parts.next() {
        Some(b"HTTP/1.1") => Version::H1_1,
        Some(b"HTTP/1.0") => Version::H1_0,
        _ => return Err(ParseError::Version),
    };
    if parts.next().is_some() {
        return Err(ParseError::Version);
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            // Trailing piece after the final newline.
            continue;
        }
        let line = strip_cr(line)?;
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::HeaderName)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
            return Err(ParseError::HeaderName);
        }
        let value = trim_ows(&line[colon + 1..]);
        if value.iter().any(|&b| b < b' ' && b != b'\t') {
            return Err(ParseError::HeaderValue);
        }
        headers.push(Header {
            // Token bytes are ASCII, checked above.
            name: str::from_utf8(name).map_err(|_| ParseError::HeaderName)?,
            value,
        });
    }

    let head = RequestHead {
        method,
        target,
        version,
        headers,
    };

    let body_len = match head.header("content-length") {
        Some(value) => str::from_utf8(value)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .ok_or(ParseError::HeaderValue)?,
        None => 0,
    };

    let consumed = head_end + body_len;
    if buf.len() < consumed {
        return Ok(None);
    }
    Ok(Some((head, consumed)))
}

/// Offset just past the `\r\n\r\n` head terminator.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| at + 4)
}

fn strip_cr(line: &[u8]) -> Result<&[u8], ParseError> {
    match line.split_last() {
        Some((b'\r', rest)) => Ok(rest),
        _ => Err(ParseError::NewLine),
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = value.split_first() {
        value = rest;
    }
    while let Some((b' ' | b'\t', rest)) = value.split_last() {
        value = rest;
    }
    value
}

fn wants_keep_alive(head: &RequestHead<'_>) -> bool {
    let connection = head.header("connection");
    match head.version {
        Version::H1_1 => !matches!(connection, Some(value) if value.eq_ignore_ascii_case(b"close")),
        Version::H1_0 => {
            matches!(connection, Some(value) if value.eq_ignore_ascii_case(b"keep-alive"))
        }
    }
}

/// Response status subset used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 200
    Ok,
    /// 204
    NoContent,
    /// 400
    BadRequest,
    /// 404
    NotFound,
    /// 431
    RequestHeaderFieldsTooLarge,
    /// 500
    InternalServerError,
}

impl Status {
    /// Numeric code.
    pub fn code(&self) -> u16 {
        match *self {
            Status::Ok => 200,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::RequestHeaderFieldsTooLarge => 431,
            Status::InternalServerError => 500,
        }
    }

    /// Reason phrase.
    pub fn reason(&self) -> &'static str {
        match *self {
            Status::Ok => "OK",
            Status::NoContent => "No Content",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

/// What a handler produces for one request.
#[derive(Debug)]
pub struct Reply {
    /// Response status.
    pub status: Status,
    /// `Content-Type` value.
    pub content_type: &'static str,
    /// Response body.
    pub body: Vec<u8>,
}

impl Reply {
    /// A `200 OK` plain-text reply.
    pub fn text(body: impl Into<Vec<u8>>) -> Reply {
        Reply {
            status: Status::Ok,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    /// An empty reply with the given status.
    pub fn empty(status: Status) -> Reply {
        Reply {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }
}

/// Produces a [`Reply`] for each parsed request. Runs on worker threads, so
/// it must be shareable.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn handle(&self, request: &RequestHead<'_>) -> Reply;
}

impl<F> Handler for F
where
    F: Fn(&RequestHead<'_>) -> Reply + Send + Sync + 'static,
{
    fn handle(&self, request: &RequestHead<'_>) -> Reply {
        self(request)
    }
}

/// HTTP/1.1 pipeline over a [`Handler`].
pub struct H1Pipeline<H> {
    handler: H,
    proxy_protocol: bool,
}

impl<H: Handler> H1Pipeline<H> {
    /// Wrap `handler` in a pipeline.
    pub fn new(handler: H) -> Self {
        H1Pipeline {
            handler,
            proxy_protocol: false,
        }
    }

    /// Accept a PROXY protocol v1 preamble ahead of the first request.
    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.proxy_protocol = enabled;
        self
    }

    fn respond(
        &self,
        io: &mut ConnIo<'_>,
        request: &mut Request<'_>,
        reply: Reply,
        head_only: bool,
    ) -> io::Result<()> {
        let keep_alive = request.flags.contains(Flags::KEEP_ALIVE);
        let cors = request.flags.contains(Flags::CORS_ALLOWED);
        {
            let dates = request.dates.clone();
            let date = dates.borrow();
            let response = &mut *request.response;
            write!(
                response,
                "HTTP/1.1 {} {}\r\nDate: {}\r\nExpires: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
                reply.status.code(),
                reply.status.reason(),
                date.date(),
                date.expires(),
                reply.content_type,
                reply.body.len(),
            )?;
            if cors {
                response.write_all(b"Access-Control-Allow-Origin: *\r\n")?;
            }
            if !keep_alive {
                response.write_all(b"Connection: close\r\n")?;
            }
            response.write_all(b"\r\n")?;
            if !head_only {
                response.write_all(&reply.body)?;
            }
        }
        io.write_all(request.response.as_bytes())
    }
}

impl<H> Debug for H1Pipeline<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H1Pipeline")
            .field("proxy_protocol", &self.proxy_protocol)
            .finish()
    }
}

impl<H: Handler> Pipeline for H1Pipeline<H> {
    fn serve(
        &self,
        io: &mut ConnIo<'_>,
        request: &mut Request<'_>,
        buf: &mut ReadBuffer,
        next: Option<usize>,
    ) -> io::Result<Option<usize>> {
        let mut at = match next {
            Some(at) => at,
            None => {
                buf.reset();
                0
            }
        };

        loop {
            if self.proxy_protocol && !request.flags.contains(Flags::PROXIED) {
                match consume_proxy_preamble(&buf.filled()[at..]) {
                    Ok(Some(consumed)) => {
                        request.flags.insert(Flags::PROXIED);
                        at += consumed;
                    }
                    Ok(None) => {}
                    // Preamble started but its newline is still in flight.
                    Err(Incomplete) => {
                        if buf.fill(io)? == 0 {
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                        continue;
                    }
                }
            }

            // The served request's borrow of `buf` must end before the
            // partial path below can refill it, hence the early returns.
            let partial = match parse(&buf.filled()[at..]) {
                Ok(Some((head, consumed))) => {
                    request
                        .flags
                        .set(Flags::KEEP_ALIVE, wants_keep_alive(&head));
                    let head_only = head.method == Method::Head;
                    let reply = self.handler.handle(&head);
                    self.respond(io, request, reply, head_only)?;

                    let end = at + consumed;
                    return Ok(if end < buf.filled().len() {
                        Some(end)
                    } else {
                        None
                    });
                }
                Ok(None) => true,
                Err(err) => {
                    log::debug!("rejecting request: {}", err);
                    false
                }
            };

            if !partial {
                request.flags.remove(Flags::KEEP_ALIVE);
                let reply = Reply::empty(Status::BadRequest);
                self.respond(io, request, reply, false)?;
                return Ok(None);
            }

            if buf.is_full() {
                if at > 0 {
                    buf.shift(at);
                    at = 0;
                    continue;
                }
                request.flags.remove(Flags::KEEP_ALIVE);
                let reply = Reply::empty(Status::RequestHeaderFieldsTooLarge);
                self.respond(io, request, reply, false)?;
                return Ok(None);
            }
            if buf.fill(io)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}

struct Incomplete;

/// Recognise a PROXY protocol v1 line. `Ok(Some(n))` consumes `n` bytes,
/// `Ok(None)` means no preamble is present, `Err` means it has not fully
/// arrived yet.
fn consume_proxy_preamble(buf: &[u8]) -> Result<Option<usize>, Incomplete> {
    const SIGNATURE: &[u8] = b"PROXY ";

    if buf.len() < SIGNATURE.len() {
        return if SIGNATURE.starts_with(buf) && !buf.is_empty() {
            Err(Incomplete)
        } else {
            Ok(None)
        };
    }
    if &buf[..SIGNATURE.len()] != SIGNATURE {
        return Ok(None);
    }

    match buf.windows(2).position(|window| window == b"\r\n") {
        Some(end) => Ok(Some(end + 2)),
        None => Err(Incomplete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_get_request() {
        let buf = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (head, consumed) = parse(buf).unwrap().unwrap();

        assert_eq!(Method::Get, head.method);
        assert_eq!("/index.html", head.target);
        assert_eq!(Version::H1_1, head.version);
        assert_eq!(Some(b"example.com" as &[u8]), head.header("host"));
        assert_eq!(buf.len(), consumed);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let buf = b"GET / HTTP/1.1\r\nX-Trace-Id: abc123\r\n\r\n";
        let (head, _) = parse(buf).unwrap().unwrap();
        assert_eq!(Some(b"abc123" as &[u8]), head.header("x-trace-id"));
    }

    #[test]
    fn incomplete_head_is_partial() {
        assert!(parse(b"GET / HTTP/1.1\r\nHost: exa").unwrap().is_none());
        assert!(parse(b"").unwrap().is_none());
    }

    #[test]
    fn body_bytes_count_toward_consumption() {
        let buf = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (head, consumed) = parse(buf).unwrap().unwrap();
        assert_eq!(Method::Post, head.method);
        assert_eq!(buf.len(), consumed);

        // Body not fully received yet.
        let partial = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert!(parse(partial).unwrap().is_none());
    }

    #[test]
    fn pipelined_requests_report_their_boundary() {
        let buf = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let (head, consumed) = parse(buf).unwrap().unwrap();
        assert_eq!("/a", head.target);

        let (second, _) = parse(&buf[consumed..]).unwrap().unwrap();
        assert_eq!("/b", second.target);
    }

    #[test]
    fn rejects_unknown_methods_and_versions() {
        assert_eq!(
            ParseError::Method,
            parse(b"BREW / HTTP/1.1\r\n\r\n").unwrap_err()
        );
        assert_eq!(
            ParseError::Version,
            parse(b"GET / HTTP/2.0\r\n\r\n").unwrap_err()
        );
        assert_eq!(
            ParseError::Target,
            parse(b"GET  HTTP/1.1\r\n\r\n").unwrap_err()
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(
            ParseError::HeaderName,
            parse(b"GET / HTTP/1.1\r\nBad Header: x\r\n\r\n").unwrap_err()
        );
        assert_eq!(
            ParseError::HeaderName,
            parse(b"GET / HTTP/1.1\r\nnocolon\r\n\r\n").unwrap_err()
        );
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        let parsed = |buf: &'static [u8]| parse(buf).unwrap().unwrap().0;

        assert!(wants_keep_alive(&parsed(b"GET / HTTP/1.1\r\n\r\n")));
        assert!(!wants_keep_alive(&parsed(
            b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"
        )));
        assert!(!wants_keep_alive(&parsed(b"GET / HTTP/1.0\r\n\r\n")));
        assert!(wants_keep_alive(&parsed(
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"
        )));
    }

    #[test]
    fn proxy_preamble_is_consumed_once_present() {
        let buf = b"PROXY TCP4 192.0.2.1 198.51.100.1 56324 80\r\nGET / HTTP/1.1\r\n\r\n";
        let consumed = consume_proxy_preamble(buf).ok().flatten().unwrap();
        assert!(buf[consumed..].starts_with(b"GET /"));

        assert!(consume_proxy_preamble(b"GET / HTTP/1.1\r\n\r\n")
            .ok()
            .flatten()
            .is_none());
        assert!(consume_proxy_preamble(b"PROXY TCP4 192.0.2.1").is_err());
        assert!(consume_proxy_preamble(b"PRO").is_err());
    }
}
